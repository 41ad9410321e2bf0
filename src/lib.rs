use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use log::info;

pub mod certificate_authority;
use crate::certificate_authority::{
    CaResponse, CertificateAuthority, ca_client::CaClient, ca_server::CaServer,
};

pub mod issuance;
use crate::issuance::Issuer;
use crate::issuance::clock::SystemClock;
use crate::issuance::policy::IssuancePolicy;
use crate::issuance::request::IssuanceRequest;

pub mod config;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// config file path
    #[arg(short = 'c', long)]
    pub config_file: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// run the CA service on a Unix socket
    Serve {
        /// socket path, overrides the configuration
        #[arg(short = 's', long)]
        socket_path: Option<String>,
    },
    /// issue a single certificate and print it
    Issue(IssueArgs),
}

#[derive(Args, Debug)]
pub struct IssueArgs {
    /// address of the bastion the certificate is bound to
    #[arg(long)]
    pub bastion_ip: String,
    /// user authenticated by the bastion
    #[arg(long)]
    pub bastion_user: String,
    /// command forced by the certificate
    #[arg(long, default_value = "")]
    pub command: String,
    /// public key file to certify
    #[arg(long)]
    pub key_file: PathBuf,
    /// principal the certificate is valid for
    #[arg(long)]
    pub remote_user: String,
    /// address of the end user
    #[arg(long, default_value = "")]
    pub user_ip: String,
    /// send the request to a running CA service instead of signing locally
    #[arg(short = 's', long)]
    pub socket_path: Option<String>,
}

/// Builds the issuance pipeline described by the configuration.
pub fn build_issuer(config: &config::Config) -> Result<Issuer> {
    let policy = IssuancePolicy::new(config.policy.clone())?;
    let ca = CertificateAuthority::new(&config.ca)?;
    info!(
        "CA public key: {}",
        ca.public_key().to_openssh().unwrap_or_default()
    );
    let clock = Arc::new(SystemClock);
    let replay_guard = policy.replay_guard(clock.clone());
    Ok(Issuer::new(policy, replay_guard, Box::new(ca), clock))
}

fn socket_path(cli: Option<String>, config: &config::Config) -> Result<String> {
    match (cli, &config.service.socket_path) {
        (Some(path), _) => Ok(path),
        (None, Some(path)) => Ok(path.to_string_lossy().to_string()),
        (None, None) => bail!("no socket path given on the command line or in the configuration"),
    }
}

pub async fn run(args: CliArgs) -> Result<()> {
    let config = config::read_config(&args.config_file)?;

    match args.command {
        Command::Serve { socket_path: cli } => {
            let socket_path = socket_path(cli, &config)?;
            let auth_token = config.service.read_auth_token()?;
            let issuer = build_issuer(&config)?;
            info!("Starting CA server");
            let ca_server = CaServer::new(
                socket_path,
                issuer,
                auth_token,
                config.service.sweep_interval,
            );
            ca_server.run().await
        }
        Command::Issue(issue) => {
            let request = IssuanceRequest {
                bastion_ip: issue.bastion_ip,
                bastion_user: issue.bastion_user,
                command: issue.command,
                key: fs::read_to_string(&issue.key_file)?,
                remote_user: issue.remote_user,
                user_ip: issue.user_ip,
            };
            let certificate = match issue.socket_path {
                None if config.service.socket_path.is_none() => {
                    let issuer = build_issuer(&config)?;
                    match issuer.issue(&request) {
                        Ok(issued) => String::from_utf8(issued.certificate)?,
                        Err(e) => bail!("{} failure: {}", e.stage(), e.public_message()),
                    }
                }
                cli => {
                    let socket_path = socket_path(cli, &config)?;
                    let client = CaClient::new(socket_path, config.service.read_auth_token()?);
                    match client.issue(request).await? {
                        CaResponse::SignedCertificate { certificate, .. } => certificate,
                        CaResponse::Rejected { stage, reason } => {
                            bail!("{} failure: {}", stage, reason)
                        }
                        CaResponse::Error(e) => bail!("CA server error: {}", e),
                    }
                }
            };
            println!("{}", certificate.trim_end());
            Ok(())
        }
    }
}
