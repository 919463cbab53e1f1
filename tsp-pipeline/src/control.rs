//! TCP control channel.
//!
//! When `control_port` is configured, a listener thread accepts one
//! text command per connection from allow-listed peers (loopback only by
//! default) and answers in plain lines:
//!
//! ```text
//! list                     stage inventory
//! bitrate                  current declared bitrate
//! suspend <stage>          pass a processor stage through
//! resume <stage>           reactivate a suspended stage
//! setlog <level> [stage]   error|warning|info|verbose|debug
//! restart <stage> [args]   restart a stage's plugin
//! exit                     orderly chain termination
//! ```
//!
//! Commands touching stage state go through the window ledger; nothing
//! here races the executors.

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};
use tsp_plugin::{Report, SessionState, Severity};

use crate::args::ControlOptions;
use crate::ledger::{StageKind, WindowLedger};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub(crate) struct ControlServer {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ControlServer {
    /// Bind the listener and start the control thread.
    pub fn start(
        options: ControlOptions,
        ledger: Arc<WindowLedger>,
        session: Arc<SessionState>,
        stage_names: Vec<String>,
        stage_reports: Vec<Report>,
    ) -> std::io::Result<Self> {
        let local = options.local.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(local, options.port);

        let socket = Socket::new(
            Domain::for_address(addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        if options.reuse_port {
            #[cfg(unix)]
            socket.set_reuse_port(true)?;
        }
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(8)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        info!(%addr, "control channel listening");

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("tsp-control".to_string())
            .spawn(move || {
                serve(listener, options, ledger, session, stage_names, stage_reports, thread_stop);
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the listener thread and wait for it.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn serve(
    listener: TcpListener,
    options: ControlOptions,
    ledger: Arc<WindowLedger>,
    session: Arc<SessionState>,
    stage_names: Vec<String>,
    stage_reports: Vec<Report>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !peer_allowed(&options, peer.ip()) {
                    warn!(%peer, "rejected control connection");
                    continue;
                }
                debug!(%peer, "control connection");
                if let Err(e) =
                    handle_session(stream, &options, &ledger, &session, &stage_names, &stage_reports)
                {
                    debug!(%peer, error = %e, "control session error");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "control accept error");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn peer_allowed(options: &ControlOptions, peer: IpAddr) -> bool {
    if options.sources.is_empty() {
        peer.is_loopback()
    } else {
        options.sources.contains(&peer)
    }
}

fn handle_session(
    stream: TcpStream,
    options: &ControlOptions,
    ledger: &WindowLedger,
    session: &SessionState,
    stage_names: &[String],
    stage_reports: &[Report],
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(options.timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let reply = execute(line.trim(), options, ledger, session, stage_names, stage_reports);
    writer.write_all(reply.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn execute(
    line: &str,
    options: &ControlOptions,
    ledger: &WindowLedger,
    session: &SessionState,
    stage_names: &[String],
    stage_reports: &[Report],
) -> String {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return "error: empty command".to_string();
    };

    match command {
        "list" => {
            let mut out = String::new();
            for (i, snapshot) in ledger.snapshot().iter().enumerate() {
                let kind = match snapshot.kind {
                    StageKind::Input => "input",
                    StageKind::Processor => "processor",
                    StageKind::Output => "output",
                };
                let state = if snapshot.suspended { " (suspended)" } else { "" };
                if i > 0 {
                    out.push('\n');
                }
                out.push_str(&format!("{i}: {kind} {}{state}", stage_names[i]));
            }
            out
        }
        "bitrate" => format!("{} b/s", session.bitrate()),
        "suspend" | "resume" => {
            let on = command == "suspend";
            match parse_stage(words.next(), stage_names.len()) {
                Ok(stage) => match ledger.set_suspended(stage, on) {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("error: {e}"),
                },
                Err(e) => e,
            }
        }
        "setlog" => match words.next().and_then(Severity::parse) {
            Some(severity) => match words.next() {
                // One stage, or every stage when none is named.
                Some(word) => match parse_stage(Some(word), stage_names.len()) {
                    Ok(stage) => {
                        stage_reports[stage].set_max_severity(severity);
                        "ok".to_string()
                    }
                    Err(e) => e,
                },
                None => {
                    for report in stage_reports {
                        report.set_max_severity(severity);
                    }
                    "ok".to_string()
                }
            },
            None => "error: setlog needs error|warning|info|verbose|debug".to_string(),
        },
        "restart" => match parse_stage(words.next(), stage_names.len()) {
            Ok(stage) => {
                let args: Vec<String> = words.map(str::to_string).collect();
                let args = (!args.is_empty()).then_some(args);
                let completion = ledger.request_restart(stage, args);
                match completion.wait(options.timeout) {
                    Some(Ok(())) => "ok".to_string(),
                    Some(Err(e)) => format!("error: {e}"),
                    None => "error: restart timed out".to_string(),
                }
            }
            Err(e) => e,
        },
        "exit" => {
            ledger.request_stop();
            "ok".to_string()
        }
        other => format!("error: unknown command '{other}'"),
    }
}

fn parse_stage(word: Option<&str>, stages: usize) -> std::result::Result<usize, String> {
    let Some(word) = word else {
        return Err("error: missing stage index".to_string());
    };
    match word.parse::<usize>() {
        Ok(stage) if stage < stages => Ok(stage),
        Ok(stage) => Err(format!("error: no stage {stage}")),
        Err(_) => Err(format!("error: invalid stage '{word}'")),
    }
}
