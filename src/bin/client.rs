use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tonic::transport::Channel;

use jes::config::ClientConfig;
use jes::pb::scheduler_client::SchedulerClient;
use jes::pb::{GetRequest, OutputRequest, ResourceLimits, StartRequest, StopRequest};
use jes::tls::TlsIdentity;

#[derive(Parser)]
#[command(name = "jes", version)]
#[command(about = "job execution service client", long_about = None)]
struct Cli {
    /// Server address in host:port format
    #[arg(long, default_value = "localhost:8080")]
    addr: String,

    /// CA chain certificate location
    #[arg(long, default_value = "ca/ca.crt")]
    ca: PathBuf,

    /// Client certificate location
    #[arg(long, default_value = "ca/client_user1.crt")]
    cert: PathBuf,

    /// Client private key location
    #[arg(long, default_value = "ca/client_user1.key")]
    key: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a job on the server
    Run {
        /// Maximum cpu usage as a percentage across all cores
        #[arg(long, default_value_t = 10)]
        cpu: u32,

        /// Maximum memory in MB
        #[arg(long, default_value_t = 1024)]
        mem: u64,

        /// Maximum read speed in bytes/s
        #[arg(long, default_value_t = 10)]
        rbps: u32,

        /// Maximum write speed in bytes/s
        #[arg(long, default_value_t = 10)]
        wbps: u32,

        /// Executable and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Report the status of a job
    Get { pid: u64 },
    /// Stream the output of a job, following until it terminates
    Output { pid: u64 },
    /// Terminate a job
    Stop { pid: u64 },
}

fn main() {
    // Helper dispatch must run before anything else: when this process is
    // the re-execed sandbox helper it never reaches the client path.
    jes::sandbox::maybe_exec_helper();

    let cli = Cli::parse();
    jes::init_tracing("jes=warn", true);
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(err) = run(cli) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig {
        addr: cli.addr,
        ca: cli.ca,
        cert: cli.cert,
        key: cli.key,
    };

    let tls = TlsIdentity::load(&config.ca, &config.cert, &config.key).await?;
    let channel = Channel::from_shared(format!("https://{}", config.addr))?
        .tls_config(tls.client())?
        .connect()
        .await?;
    let mut client = SchedulerClient::new(channel);

    match cli.command {
        Commands::Run {
            cpu,
            mem,
            rbps,
            wbps,
            command,
        } => run_job(&mut client, cpu, mem, rbps, wbps, command).await,
        Commands::Get { pid } => get(&mut client, pid).await,
        Commands::Output { pid } => output(&mut client, pid).await,
        Commands::Stop { pid } => stop(&mut client, pid).await,
    }
}

async fn run_job(
    client: &mut SchedulerClient<Channel>,
    cpu: u32,
    mem: u64,
    rbps: u32,
    wbps: u32,
    command: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (cmd, args) = command.split_first().ok_or("no command to run")?;

    let response = client
        .start(StartRequest {
            cmd: cmd.clone(),
            args: args.to_vec(),
            limits: Some(ResourceLimits {
                cpu_percent: cpu,
                memory_mb: mem,
                read_bps: rbps,
                write_bps: wbps,
            }),
        })
        .await?
        .into_inner();

    if let Some(error) = response.error {
        return Err(error.into());
    }
    println!("Process ID: {}", response.pid);
    Ok(())
}

async fn get(
    client: &mut SchedulerClient<Channel>,
    pid: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.get(GetRequest { pid }).await?.into_inner();
    if !response.found {
        return Err(format!("pid {pid} does not exist").into());
    }
    println!("PID: {}, Status: {}", response.pid, response.status);
    Ok(())
}

async fn output(
    client: &mut SchedulerClient<Channel>,
    pid: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = client.stdout(OutputRequest { pid }).await?.into_inner();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            message = stream.message() => match message? {
                Some(chunk) => {
                    stdout.write_all(&chunk.data).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
            // interrupting a follow is not an error
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn stop(
    client: &mut SchedulerClient<Channel>,
    pid: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let _ = client.stop(StopRequest { pid }).await?;
    Ok(())
}
