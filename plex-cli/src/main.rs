// plex: serve a demo method table over TCP, or call a method on a running server.

mod config;

use std::net::SocketAddr;

use anyhow::{anyhow, bail, Context};
use plex_core::ResultShape;
use plex_tokio::{
    Encoding, Event, Events, LocalStream, Method, MethodTable, Peer, RemoteError, RemoteReader,
    RemoteStream, SessionBuilder, StreamFuture, Value,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: plex [--version] serve [addr] | call <addr> <method> [args...]";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    for arg in &args {
        if arg == "--version" || arg == "-V" {
            println!("plex {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new()?;
    match args.first().map(String::as_str) {
        Some("serve") => {
            let addr = args.get(1).unwrap_or(&cfg.listen).parse::<SocketAddr>()?;
            rt.block_on(serve(addr, cfg))
        }
        Some("call") => {
            let (Some(addr), Some(method)) = (args.get(1), args.get(2)) else {
                bail!(USAGE);
            };
            let addr = addr.parse::<SocketAddr>()?;
            let values = args[3..].iter().map(|a| parse_arg(a)).collect();
            rt.block_on(call(addr, method, values, cfg))
        }
        _ => bail!(USAGE),
    }
}

/// Command-line words become ints, bools or strings.
fn parse_arg(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::Int(i);
    }
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::from(s),
    }
}

fn show(v: &Value) -> String {
    match v {
        Value::Str(s) => s.clone(),
        other => format!("{other:?}"),
    }
}

fn path_arg(args: &[Value], i: usize) -> std::io::Result<String> {
    args.get(i)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("argument {i} must be a path")))
}

fn open_file(args: &[Value], i: usize) -> StreamFuture {
    let path = path_arg(args, i);
    Box::pin(async move { Ok(LocalStream::reader(tokio::fs::File::open(path?).await?)) })
}

/// Demo methods exposed by `plex serve`.
fn demo_table() -> anyhow::Result<MethodTable> {
    let table = MethodTable::new()
        .with(Method::handler("echo", |args| async move { Ok::<_, RemoteError>(args) }))?
        .with(
            Method::handler("add", |args| async move {
                let mut sum = 0i64;
                for a in &args {
                    sum += a
                        .as_i64()
                        .ok_or_else(|| RemoteError::failed(format!("not an integer: {}", show(a))))?;
                }
                Ok::<_, RemoteError>(vec![Value::Int(sum)])
            })
            .with_arity(2),
        )?
        .with(Method::duplex_stream("upper", Encoding::Utf8, |_| async {
            let (input, mut from_caller) = tokio::io::duplex(16 * 1024);
            let (mut to_caller, output) = tokio::io::duplex(16 * 1024);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match from_caller.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    buf[..n].make_ascii_uppercase();
                    if to_caller.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                let _ = to_caller.shutdown().await;
            });
            Ok(LocalStream::duplex(output, input))
        }))?
        .with(Method::read_stream("cat", Encoding::Utf8, |args| open_file(&args, 0)).with_arity(1))?
        .with(
            Method::sync_read_streams("multicat", Encoding::Utf8, 2, |args| {
                vec![open_file(&args, 0), open_file(&args, 1)]
            })
            .with_arity(2),
        )?;
    Ok(table)
}

async fn serve(addr: SocketAddr, cfg: config::Config) -> anyhow::Result<()> {
    let table = demo_table()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, methods = table.len(), "serving");
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let (peer, events) = SessionBuilder::new(table.clone())
                    .config(cfg.session.clone())
                    .connect(stream);
                info!(%remote, session = %peer.id(), "connection accepted");
                tokio::spawn(watch_session(peer, events));
            }
            res = &mut shutdown => {
                info!("shutting down");
                return res;
            }
        }
    }
}

/// Log a served session's events; hang up on a peer that stopped answering probes.
async fn watch_session(peer: Peer, mut events: Events) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Methods(m) => info!(session = %peer.id(), remote_methods = m.len(), "peer ready"),
            Event::Heartbeat { round_trip, .. } => {
                tracing::debug!(session = %peer.id(), ?round_trip, "heartbeat")
            }
            Event::Death => {
                warn!(session = %peer.id(), "peer dead, closing");
                peer.close().await;
            }
            Event::Closed => break,
        }
    }
}

async fn call(addr: SocketAddr, method: &str, args: Vec<Value>, cfg: config::Config) -> anyhow::Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    let (peer, _events) = SessionBuilder::new(MethodTable::new())
        .config(cfg.session)
        .connect(stream);
    let methods = peer.remote_methods().await?;
    let stub = methods
        .get(method)
        .ok_or_else(|| anyhow!("no such method: {method} (remote has: {:?})", methods))?;

    match stub.descriptor().shape {
        ResultShape::Callback => {
            for v in stub.call(args).await? {
                println!("{}", show(&v));
            }
        }
        ResultShape::Stream(_) => print_stream(stub.open_stream(args).await?).await?,
        ResultShape::SyncStreams(_) => {
            for s in stub.open_sync_streams(args).await? {
                print_stream(s).await?;
            }
        }
    }
    peer.close().await;
    Ok(())
}

/// Readers go to stdout; writers are fed from stdin.
async fn print_stream(stream: RemoteStream) -> anyhow::Result<()> {
    match stream {
        RemoteStream::Reader(r) => copy_to_stdout(r).await,
        RemoteStream::Writer(mut w) => {
            let mut input = Vec::new();
            tokio::io::stdin().read_to_end(&mut input).await?;
            w.write_all(&input).await?;
            w.close().await?;
            Ok(())
        }
        RemoteStream::Duplex(d) => {
            let (r, mut w) = d.split();
            let feed = async move {
                let mut input = Vec::new();
                tokio::io::stdin().read_to_end(&mut input).await?;
                w.write_all(&input).await?;
                w.close().await?;
                anyhow::Ok(())
            };
            let (fed, copied) = tokio::join!(feed, copy_to_stdout(r));
            fed.and(copied)
        }
    }
}

async fn copy_to_stdout(mut reader: RemoteReader) -> anyhow::Result<()> {
    let mut out = tokio::io::stdout();
    while let Some(chunk) = reader.recv().await {
        match chunk? {
            Value::Str(s) => out.write_all(s.as_bytes()).await?,
            Value::Bytes(b) => out.write_all(&b).await?,
            other => out.write_all(format!("{other:?}\n").as_bytes()).await?,
        }
    }
    out.flush().await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_become_typed_values() {
        assert_eq!(parse_arg("42"), Value::Int(42));
        assert_eq!(parse_arg("-7"), Value::Int(-7));
        assert_eq!(parse_arg("true"), Value::Bool(true));
        assert_eq!(parse_arg("foo.txt"), Value::from("foo.txt"));
    }

    #[test]
    fn demo_table_advertises_every_method() {
        let table = demo_table().unwrap();
        let names: Vec<_> = table
            .registry()
            .descriptors()
            .into_iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(names, vec!["add", "cat", "echo", "multicat", "upper"]);
    }

    #[tokio::test]
    async fn upper_round_trips_over_a_memory_pair() {
        let (a, b) = plex_tokio::memory_pair(64 * 1024);
        let (client, _) = SessionBuilder::new(MethodTable::new()).connect(a);
        let (_server, _) = SessionBuilder::new(demo_table().unwrap()).connect(b);
        let methods = client.remote_methods().await.unwrap();
        let (r, mut w) = methods
            .get("upper")
            .unwrap()
            .open_stream(vec![])
            .await
            .unwrap()
            .into_duplex()
            .unwrap()
            .split();
        w.write_all(b"hello plex").await.unwrap();
        w.close().await.unwrap();
        assert_eq!(r.read_to_string().await.unwrap(), "HELLO PLEX");
        assert_eq!(
            methods.call("add", vec![Value::Int(2), Value::Int(40)]).await.unwrap(),
            vec![Value::Int(42)]
        );
    }
}
