use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;

use jes::config::{ServerConfig, CONNECTION_TIMEOUT};
use jes::executor::Executor;
use jes::rbac::Rbac;
use jes::shutdown::Shutdown;
use jes::tls::TlsIdentity;
use jes::{SchedulerServer, SchedulerService};

#[derive(Parser, Debug)]
#[command(name = "jes-server", version)]
#[command(about = "job execution service gRPC server")]
struct Args {
    /// Listen address in host:port format
    #[arg(long, default_value = "localhost:8080")]
    listen: String,

    /// CA certificate location
    #[arg(long, default_value = "ca/ca.crt")]
    ca: PathBuf,

    /// Server certificate location
    #[arg(long, default_value = "ca/server.crt")]
    cert: PathBuf,

    /// Server private key location
    #[arg(long, default_value = "ca/server.key")]
    key: PathBuf,
}

fn main() {
    // Helper dispatch must run before anything else: when this process is
    // the re-execed sandbox helper it never reaches the server path.
    jes::sandbox::maybe_exec_helper();

    let args = Args::parse();
    jes::init_tracing("jes=info", false);
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(err) = run(args) {
        eprintln!("{err}");
        std::process::exit(1);
    }
    tracing::info!("terminated");
}

#[tokio::main]
async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig {
        listen: args.listen,
        ca: args.ca,
        cert: args.cert,
        key: args.key,
    };

    let addr = config
        .listen
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("could not resolve listen address {:?}", config.listen))?;

    let tls = TlsIdentity::load(&config.ca, &config.cert, &config.key).await?;

    let executor = Arc::new(Executor::new()?);
    let rbac = Arc::new(Rbac::new());
    let service = SchedulerService::new(executor, rbac);

    let shutdown = Shutdown::new()?;

    tracing::info!(address = %addr, "starting server");
    Server::builder()
        .tls_config(tls.server())?
        .timeout(CONNECTION_TIMEOUT)
        .add_service(SchedulerServer::new(service))
        .serve_with_shutdown(addr, async move {
            let sig = shutdown.recv().await;
            tracing::info!(signal = sig, "signal received, stopping server");
        })
        .await?;

    Ok(())
}
