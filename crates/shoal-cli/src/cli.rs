use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use shoal::{ClusterError, DaemonConfig, Hooks, Member, Role, Shoal};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "Manage a shoal cluster member", long_about = None)]
pub struct Cli {
    /// State directory of the daemon.
    #[arg(short, long, env = "SHOAL_STATE_DIR", default_value = "/var/lib/shoal")]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon.
    Serve {
        /// Group granted access to the control socket.
        #[arg(long, default_value = "")]
        socket_group: String,
        /// Seconds to drain in-flight requests on shutdown.
        #[arg(long, default_value = "30")]
        drain_timeout: u64,
    },
    /// Wait for the daemon to become ready.
    WaitReady {
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
    /// Show member status.
    Status,
    /// Bootstrap a new cluster with this member.
    Bootstrap {
        name: String,
        address: String,
    },
    /// Join an existing cluster with a token.
    Join {
        name: String,
        address: String,
        token: String,
    },
    /// Manage join tokens.
    Token {
        #[command(subcommand)]
        cmd: TokenCmd,
    },
    /// List cluster members.
    Members,
    /// Gracefully remove a member.
    Remove {
        name: String,
    },
    /// Run a query against the replicated database.
    Sql {
        query: String,
    },
    /// Rebuild the cluster configuration after losing quorum.
    ///
    /// Every member's daemon must be stopped, and this member must hold
    /// the most recent database log. Members keep their id, name and
    /// address; only roles change, given as name=role pairs
    /// (voter, stand-by or spare).
    Recover {
        /// Role assignments, e.g. n1=voter n2=spare n3=spare.
        roles: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum TokenCmd {
    /// Issue a token for a prospective member.
    Add { name: String },
    /// List outstanding tokens.
    List,
    /// Revoke an unused token.
    Revoke { name: String },
}

impl Cli {
    pub async fn run(self) -> shoal::Result<()> {
        let config = DaemonConfig {
            state_dir: self.state_dir.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..DaemonConfig::default()
        };

        match self.command {
            Command::Serve {
                socket_group,
                drain_timeout,
            } => {
                let config = DaemonConfig {
                    socket_group,
                    drain_timeout_secs: drain_timeout,
                    ..config
                };
                Shoal::new(config)?.start(Vec::new(), Hooks::default()).await
            }
            Command::WaitReady { timeout } => {
                Shoal::new(config)?
                    .ready(Some(Duration::from_secs(timeout)))
                    .await
            }
            Command::Status => {
                let status = Shoal::new(config)?.status().await?;
                println!(
                    "name: {}\naddress: {}\nphase: {}\nversion: {}\nmembers: {}",
                    status.name, status.address, status.phase, status.version, status.members
                );
                Ok(())
            }
            Command::Bootstrap { name, address } => {
                Shoal::new(config)?
                    .new_cluster(&name, &address, HashMap::new())
                    .await
            }
            Command::Join {
                name,
                address,
                token,
            } => {
                Shoal::new(config)?
                    .join_cluster(&name, &address, &token, HashMap::new())
                    .await
            }
            Command::Token { cmd } => {
                let app = Shoal::new(config)?;
                match cmd {
                    TokenCmd::Add { name } => {
                        println!("{}", app.new_join_token(&name).await?);
                        Ok(())
                    }
                    TokenCmd::List => {
                        for record in app.list_join_tokens().await? {
                            println!("{}\texpires at {}", record.name, record.expires_at);
                        }
                        Ok(())
                    }
                    TokenCmd::Revoke { name } => app.revoke_join_token(&name).await,
                }
            }
            Command::Members => {
                for member in Shoal::new(config)?.members().await? {
                    println!("{}\t{}\t{}\t{}", member.id, member.name, member.address, member.role);
                }
                Ok(())
            }
            Command::Remove { name } => Shoal::new(config)?.remove_member(&name).await,
            Command::Sql { query } => {
                println!("{}", Shoal::new(config)?.sql(&query).await?);
                Ok(())
            }
            Command::Recover { roles } => {
                let app = Shoal::new(config)?;
                let current = app.current_cluster_members()?;
                let members = apply_roles(current, &roles)?;
                let tarball = app.recover_from_quorum_loss(members)?;
                println!(
                    "recovery tarball written to {}\ncopy it into the state directory of every other member, then restart them",
                    tarball.display()
                );
                Ok(())
            }
        }
    }
}

/// Applies `name=role` assignments to the current member set.
fn apply_roles(mut members: Vec<Member>, roles: &[String]) -> shoal::Result<Vec<Member>> {
    for assignment in roles {
        let (name, role) = assignment.split_once('=').ok_or_else(|| {
            ClusterError::internal(format!("expected name=role, got {assignment:?}"))
        })?;
        let role = match role {
            "voter" => Role::Voter,
            "stand-by" => Role::StandBy,
            "spare" => Role::Spare,
            other => {
                return Err(ClusterError::internal(format!(
                    "unknown role {other:?}, expected voter, stand-by or spare"
                )))
            }
        };
        let member = members
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| ClusterError::internal(format!("no cluster member named {name:?}")))?;
        member.role = role;
    }
    Ok(members)
}
