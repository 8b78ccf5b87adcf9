//! dept-call terminal client
//!
//! Registers with the signaling server and drives calls from stdin:
//! `who [dept]`, `depts`, `call <id>...`, `accept`, `reject`, `end`,
//! `state`, `quit`.
//!
//! Built with `native-audio` it talks through the default microphone and
//! speaker; otherwise calls connect without local audio.

use anyhow::Context;
use clap::Parser;
#[cfg(not(feature = "native-audio"))]
use dept_call::call::SampleTrackDevices;
use dept_call::call::{MediaDevices, WebRtcConnector};
#[cfg(feature = "native-audio")]
use dept_call::call::{MicrophoneDevices, Playback, Speaker};
use dept_call::{CallClient, CallEvent, ClientConfig, ClientEvent, Identity};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "Department call terminal client", long_about = None)]
struct Args {
    /// Signaling server URL (ws://, wss://, http:// or https://)
    #[arg(short, long, env = "SIGNALING_URL")]
    server: Option<String>,

    /// Staff user id to register as
    #[arg(short, long, env = "DEPT_CALL_USER")]
    user: String,

    /// Department (e.g. ICU, ER)
    #[arg(short, long, env = "DEPT_CALL_DEPARTMENT")]
    department: String,

    #[arg(short, long, env = "DEPT_CALL_ROLE", default_value = "staff")]
    role: String,

    /// Display name shown to callees
    #[arg(short, long, env = "DEPT_CALL_NAME")]
    name: Option<String>,

    /// Bearer token for the upgrade request
    #[arg(long, env = "SIGNALING_TOKEN")]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dept_call::init_tracing();
    let args = Args::parse();

    let mut identity = Identity::new(args.user, args.department, args.role);
    if let Some(name) = args.name {
        identity = identity.with_display_name(name);
    }

    let mut config = ClientConfig::from_env(identity).context("invalid configuration")?;
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if args.token.is_some() {
        config.auth_token = args.token;
    }
    config.validate().context("invalid configuration")?;

    let self_id = config.identity.user_id.clone();
    let (connector, media) = audio_backend(WebRtcConnector::new(&config.ice_servers));
    let mut audio = AudioOut::default();

    let (mut client, mut events) = CallClient::connect(config, media, Arc::new(connector))
        .await
        .context("failed to connect to signaling server")?;
    println!("Connected. Type `help` for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&client, &self_id, line.trim()).await {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                audio.handle(&event).await;
                if matches!(event, ClientEvent::ConnectionFailed { .. }) {
                    break;
                }
            }
        }
    }

    client.close().await;
    Ok(())
}

#[cfg(feature = "native-audio")]
fn audio_backend(connector: WebRtcConnector) -> (WebRtcConnector, Arc<dyn MediaDevices>) {
    (connector.pcmu_only(), Arc::new(MicrophoneDevices::new()))
}

#[cfg(not(feature = "native-audio"))]
fn audio_backend(connector: WebRtcConnector) -> (WebRtcConnector, Arc<dyn MediaDevices>) {
    tracing::warn!("Built without native-audio; calls carry no microphone audio");
    (connector, Arc::new(SampleTrackDevices::new()))
}

/// Plays the remote party until the call ends
#[cfg(feature = "native-audio")]
#[derive(Default)]
struct AudioOut {
    speaker: Speaker,
    playback: Option<Playback>,
}

#[cfg(feature = "native-audio")]
impl AudioOut {
    async fn handle(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::Call(CallEvent::RemoteStream(stream)) => {
                match self.speaker.play(stream).await {
                    Ok(playback) => self.playback = Some(playback),
                    Err(e) => println!("* cannot play remote audio: {}", e),
                }
            }
            ClientEvent::Call(CallEvent::Ended { .. }) | ClientEvent::Disconnected => {
                self.playback = None;
            }
            _ => {}
        }
    }
}

#[cfg(not(feature = "native-audio"))]
#[derive(Default)]
struct AudioOut;

#[cfg(not(feature = "native-audio"))]
impl AudioOut {
    async fn handle(&mut self, _event: &ClientEvent) {}
}

/// Runs one stdin command; returns false on `quit`
async fn run_command(client: &CallClient, self_id: &str, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };

    let result = match command {
        "who" => {
            match parts.next() {
                Some(dept) => println!("{}: {:?}", dept, client.users_in_department(dept)),
                None => {
                    for user in client.presence().callable_users(self_id) {
                        println!(
                            "  {} [{}] {} ({})",
                            user.user_id, user.department, user.role, user.status
                        );
                    }
                }
            }
            Ok(())
        }
        "depts" => {
            for dept in client.departments() {
                println!("  {}", dept);
            }
            Ok(())
        }
        "call" => {
            let targets: Vec<String> = parts.map(str::to_string).collect();
            client
                .initiate_call(targets)
                .await
                .map(|id| println!("Calling... (call {})", id))
        }
        "accept" => client.accept_call().await,
        "reject" => client.reject_call().await,
        "end" => client.end_call().await,
        "state" => {
            println!("Call state: {}", client.call_state());
            Ok(())
        }
        "quit" | "exit" => return false,
        _ => {
            println!("Commands: who [dept], depts, call <id>..., accept, reject, end, state, quit");
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("Error: {}", e);
    }
    true
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected => println!("* connected"),
        ClientEvent::Disconnected => println!("* disconnected"),
        ClientEvent::Reconnecting { attempt, delay } => {
            println!("* reconnecting in {:?} (attempt {})", delay, attempt)
        }
        ClientEvent::ConnectionFailed { attempts } => {
            println!("* gave up after {} reconnect attempt(s)", attempts)
        }
        ClientEvent::PresenceChanged(snapshot) => println!("* {} user(s) online", snapshot.len()),
        ClientEvent::Call(CallEvent::Incoming {
            caller_id,
            caller_name,
            ..
        }) => println!("* incoming call from {} ({}), `accept` or `reject`", caller_name, caller_id),
        ClientEvent::Call(CallEvent::StateChanged(state)) => println!("* call state: {}", state),
        ClientEvent::Call(CallEvent::Rejected { reason, .. }) => {
            println!("* call rejected ({})", reason.as_deref().unwrap_or("no reason"))
        }
        ClientEvent::Call(CallEvent::Declined {
            callee_id,
            remaining,
            ..
        }) => println!(
            "* {} declined, {} still ringing",
            callee_id.as_deref().unwrap_or("a callee"),
            remaining
        ),
        ClientEvent::Call(CallEvent::Ended { reason, .. }) => println!("* call ended: {:?}", reason),
        ClientEvent::Call(CallEvent::BusyRejected { caller_id, .. }) => {
            println!("* missed call from {} while busy", caller_id)
        }
        ClientEvent::Call(CallEvent::RemoteStream(stream)) => {
            println!("* receiving audio ({})", stream.track_id)
        }
        ClientEvent::Call(CallEvent::Error(e)) => println!("* call error: {}", e),
    }
}
