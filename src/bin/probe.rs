use std::cell::Cell;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;

use dgram_carrier::*;

fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = try_run(args) {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}

#[derive(Parser)]
#[command(version = "0.1")]
struct Args {
    #[arg(short, long, value_enum, default_value = "cooperative")]
    backend: Backend,
    /// Reply wait per attempt, in milliseconds.
    #[arg(short, long, default_value = "1000")]
    timeout_ms: u64,
    /// Hexdump payloads in trace output.
    #[arg(long)]
    trace_payloads: bool,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Cooperative,
    Reactor,
}

#[derive(Subcommand)]
enum Mode {
    /// Send one payload and print the first reply.
    Send(SendConfig),
    /// Answer every datagram with its own payload.
    Echo(EchoConfig),
}

#[derive(Parser)]
struct SendConfig {
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    target: SocketAddr,
    #[arg(short, long, default_value = "PING")]
    payload: String,
    #[arg(short, long, default_value = "3")]
    retries: u32,
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[derive(Parser)]
struct EchoConfig {
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    listen: SocketAddr,
}

type Reply = Arc<Mutex<Option<(AddressPair, Vec<u8>)>>>;

fn try_run(args: Args) -> Result<()> {
    let config = TransportConfig::default()
        .with_log_target("probe")
        .with_trace_payloads(args.trace_payloads);
    let timeout = Duration::from_millis(args.timeout_ms);

    match (args.mode, args.backend) {
        (Mode::Send(send), Backend::Cooperative) => {
            let transport = DgramTransport::new(config);
            transport.open_client_mode(send.bind)?;
            let reply = capture_reply(&transport);

            let payload = send.payload.into_bytes();
            transport.send_message(payload.clone(), send.target.into())?;
            let retransmits = Cell::new(0);
            let expired = Cell::new(false);
            transport.dispatch_while(
                timeout,
                |_now| {
                    if retransmits.get() < send.retries {
                        log::info!("no reply from {}, retrying", send.target);
                        retransmits.set(retransmits.get() + 1);
                        let _ = transport.send_message(payload.clone(), send.target.into());
                    } else {
                        expired.set(true);
                    }
                },
                || reply.lock().is_none() && !expired.get(),
            )?;
            transport.close();
            print_reply(&reply, send.target)
        }
        (Mode::Send(send), Backend::Reactor) => {
            let reactor = Reactor::new()?;
            let transport = ReactorTransport::new(&reactor, config);
            transport.open_client_mode(send.bind)?;
            let reply = capture_reply(&transport);

            let payload = send.payload.into_bytes();
            for attempt in 0..=send.retries {
                if attempt > 0 {
                    log::info!("no reply from {}, retrying", send.target);
                }
                transport.send_message(payload.clone(), send.target.into())?;
                reactor.run_for(timeout)?;
                if reply.lock().is_some() {
                    break;
                }
            }
            reactor.stop();
            print_reply(&reply, send.target)
        }
        (Mode::Echo(echo), Backend::Cooperative) => {
            let transport = DgramTransport::new(config);
            transport.open_server_mode(echo.listen)?;
            transport.register_callback(Box::new(echo_back));
            println!("echoing on {:?}", transport.local_addr());
            loop {
                transport.dispatch_once(timeout, |_| {}, || true)?;
            }
        }
        (Mode::Echo(echo), Backend::Reactor) => {
            let reactor = Reactor::new()?;
            let transport = ReactorTransport::new(&reactor, config);
            transport.open_server_mode(echo.listen)?;
            transport.register_callback(Box::new(echo_back));
            println!("echoing on {:?}", transport.local_addr());
            reactor.run()?;
            Ok(())
        }
    }
}

fn capture_reply(transport: &dyn Transport) -> Reply {
    let reply: Reply = Arc::new(Mutex::new(None));
    let slot = reply.clone();
    transport.register_callback(Box::new(move |_, from, payload| {
        let mut slot = slot.lock();
        if slot.is_none() {
            *slot = Some((from, payload));
        }
    }));
    reply
}

fn echo_back(transport: &dyn Transport, from: AddressPair, payload: Vec<u8>) {
    if let Err(e) = transport.send_message(payload, from.into()) {
        log::warn!("could not echo to {}: {}", from.remote_addr(), e);
    }
}

fn print_reply(reply: &Reply, target: SocketAddr) -> Result<()> {
    let reply = reply.lock().take();
    let (from, payload) = reply.ok_or_else(|| anyhow!("no reply from {}", target))?;
    println!(
        "{} bytes from {}: {}",
        payload.len(),
        from.remote_addr(),
        String::from_utf8_lossy(&payload)
    );
    Ok(())
}
