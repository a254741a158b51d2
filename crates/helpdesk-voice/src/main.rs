//! helpdesk-call: talk to a support agent from the terminal.
//!
//! Usage:
//!   cargo run -p helpdesk-voice --bin helpdesk-call -- [--agent ID] [--language LANG] [--mute]
//!
//! Negotiates a session with `HELPDESK__NEGOTIATION_URL`, opens the default microphone
//! and speaker, and prints the transcript until the agent hangs up or Ctrl-C.

use helpdesk_voice::{CallController, CallEvent, CallPreferences, Role, VoiceClientConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = VoiceClientConfig::load()?;
    let mut preferences = CallPreferences::from_config(&config);

    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--agent" => {
                if let Some(id) = args.next() {
                    preferences.agent_id = id;
                }
            }
            "--language" => {
                preferences.language = args.next();
            }
            "--mute" => preferences.muted = true,
            "--help" | "-h" => {
                eprintln!("helpdesk-call: voice call with a support agent");
                eprintln!("  --agent ID        Agent to call (default from config: {})", config.agent_id);
                eprintln!("  --language LANG   Ask the agent to speak LANG (\"auto\" to let it choose)");
                eprintln!("  --mute            Join with the microphone muted");
                eprintln!();
                eprintln!("Config: HELPDESK_CONFIG file, HELPDESK__* env vars. Ctrl-C hangs up.");
                return Ok(());
            }
            other => eprintln!("Ignoring unknown argument: {}", other),
        }
    }

    let mut controller = CallController::with_system_devices(config);
    let mut events = controller
        .take_event_receiver()
        .ok_or("event receiver already taken")?;

    let call = controller.start_call(preferences).await?;
    info!("Call {} connected to {}", call.session_id, call.endpoint);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nHanging up...");
                break;
            }
            event = events.recv() => match event {
                Some(CallEvent::Transcript(entry)) => {
                    let who = match entry.role {
                        Role::User => "you",
                        Role::Agent => "agent",
                    };
                    println!("[{}] {}: {}", entry.timestamp.format("%H:%M:%S"), who, entry.text);
                }
                Some(CallEvent::StateChanged { to, .. }) => println!("-- {}", to),
                Some(CallEvent::Error(message)) => eprintln!("!! {}", message),
                Some(CallEvent::Resolved { .. }) | None => break,
            },
        }
    }

    controller.end_call().await;
    Ok(())
}
