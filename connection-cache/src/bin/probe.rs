use anyhow::{bail, Context, Result};
use clap::Parser;
use connection_cache::tracing_util::{self, Format};
use connection_cache::{
    Config, ConnectionCache, ConnectionId, Connector, Destination, Job, JobError, ProxyDescriptor,
    TcpConnector, TlsConnector, TransportLease,
};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "connection-cache-probe")]
#[command(about = "Send HEAD requests through the connection cache and print its state")]
#[command(version)]
struct Args {
    #[arg(required = true)]
    #[arg(help = "URLs to probe, http:// or https://")]
    urls: Vec<Destination>,

    #[arg(long)]
    #[arg(help = "Tunnel through a SOCKS5 proxy, e.g. socks5://127.0.0.1:9050")]
    socks5: Option<ProxyDescriptor>,

    #[arg(short, long, default_value = "1")]
    #[arg(help = "Number of requests submitted per URL at once")]
    jobs: usize,

    #[arg(long, default_value = "250")]
    #[arg(help = "How long each request keeps its connection after the response")]
    hold_ms: u64,

    #[arg(short, long)]
    #[arg(help = "TOML file overriding the cache configuration")]
    config: Option<PathBuf>,

    #[arg(long)]
    #[arg(help = "Print logs and the final cache state as JSON")]
    json: bool,

    #[arg(short, long)]
    #[arg(help = "Enable verbose logging")]
    verbose: bool,
}

#[derive(Debug)]
enum Outcome {
    Finished {
        name: String,
        connection: ConnectionId,
        status: String,
    },
    Failed {
        name: String,
        reason: JobError,
    },
}

/// Sends one HEAD request over its lease, keeps the connection for a while
/// and hands it back to the cache.
struct ProbeJob<C: Connector> {
    name: String,
    cache: ConnectionCache<C>,
    hold: Duration,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl<C: Connector> Job<C::Transport> for ProbeJob<C> {
    fn start(&self, mut lease: TransportLease<C::Transport>) {
        let name = self.name.clone();
        let cache = self.cache.clone();
        let hold = self.hold;
        let outcomes = self.outcomes.clone();

        tokio::spawn(async move {
            let status = match head(&mut lease).await {
                Ok(status) => status,
                Err(error) => format!("request failed: {:#}", error),
            };
            tokio::time::sleep(hold).await;

            let connection = lease.connection().id();
            cache.notify_job_finished(lease).await;
            let _ = outcomes.send(Outcome::Finished {
                name,
                connection,
                status,
            });
        });
    }

    fn fail(&self, reason: JobError) {
        let _ = self.outcomes.send(Outcome::Failed {
            name: self.name.clone(),
            reason,
        });
    }
}

/// Writes a keep-alive HEAD request and returns the response's status line.
async fn head<T: connection_cache::Transport>(lease: &mut TransportLease<T>) -> Result<String> {
    let url = lease.destination().url().clone();
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: connection-cache-probe\r\nConnection: keep-alive\r\n\r\n",
        url.path(),
        lease.destination().host()
    );
    lease.write_all(request.as_bytes()).await?;
    lease.flush().await?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    while !response.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = lease.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..read]);
        if response.len() > 64 * 1024 {
            bail!("Response headers exceed 64 KiB");
        }
    }

    let status = String::from_utf8_lossy(&response)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    Ok(status)
}

fn submit<C: Connector>(
    cache: &ConnectionCache<C>,
    destination: &Destination,
    proxy: &ProxyDescriptor,
    args: &Args,
    outcomes: &mpsc::UnboundedSender<Outcome>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..args.jobs)
        .map(|n| {
            let cache = cache.clone();
            let destination = destination.clone();
            let proxy = proxy.clone();
            let job = ProbeJob {
                name: format!("{} [{}]", destination, n),
                cache: cache.clone(),
                hold: Duration::from_millis(args.hold_ms),
                outcomes: outcomes.clone(),
            };

            tokio::spawn(async move {
                cache
                    .acquire_connection(&destination, &proxy, std::sync::Arc::new(job))
                    .await;
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.json { Format::Json } else { Format::Raw };
    tracing_util::init(format, args.verbose)?;

    let config = match &args.config {
        Some(path) => Config::read(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    let proxy = args.socks5.clone().unwrap_or_default();
    if !proxy.is_direct() {
        tracing::info!(%proxy, "Tunnelling every connection through the proxy");
    }

    let tcp = ConnectionCache::new(TcpConnector, config.clone())?;
    let tls = ConnectionCache::new(TlsConnector::default(), config)?;

    let (sender, mut receiver) = mpsc::unbounded_channel();
    let mut submissions = Vec::new();
    for destination in &args.urls {
        match destination.scheme() {
            "http" => submissions.extend(submit(&tcp, destination, &proxy, &args, &sender)),
            "https" => submissions.extend(submit(&tls, destination, &proxy, &args, &sender)),
            other => bail!("Unsupported scheme `{}` in {}", other, destination),
        }
    }
    drop(sender);

    for submission in submissions {
        submission.await?;
    }

    let expected = args.urls.len() * args.jobs;
    for _ in 0..expected {
        let Some(outcome) = receiver.recv().await else {
            break;
        };
        match outcome {
            Outcome::Finished {
                name,
                connection,
                status,
            } => println!("{}: {} on connection {}", name, status, connection),
            Outcome::Failed { name, reason } => println!("{}: {}", name, reason),
        }
    }

    let tcp = tcp.dump().await;
    let tls = tls.dump().await;

    if args.json {
        println!("{}", json!({ "tcp": tcp.to_json(), "tls": tls.to_json() }));
    } else {
        println!("TCP:\n{}", tcp);
        println!("TLS:\n{}", tls);
    }

    Ok(())
}
