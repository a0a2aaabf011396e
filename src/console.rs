use std::io::BufRead;

use tokio::sync::mpsc;
use tracing::{ info, warn };

use crate::connection::DeviceHandle;

/// One operator command typed on stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    /// Point the bridge at another device and reconnect.
    Host(String),
    Volume(f32),
    Play(String),
    Announce(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty command".to_string())?;
        let arg = words.next();
        if words.next().is_some() {
            return Err(format!("too many arguments for {verb}"));
        }

        let need = |what: &str| arg.map(str::to_string).ok_or_else(|| format!("{verb} needs {what}"));

        match verb {
            "start" => Ok(ConsoleCommand::Start),
            "stop" => Ok(ConsoleCommand::Stop),
            "host" => Ok(ConsoleCommand::Host(need("a hostname")?)),
            "volume" => {
                let volume: f32 = need("a level")?
                    .parse()
                    .map_err(|_| "volume must be a number".to_string())?;
                if !(0.0..=1.0).contains(&volume) {
                    return Err("volume must be between 0 and 1".into());
                }
                Ok(ConsoleCommand::Volume(volume))
            }
            "play" => Ok(ConsoleCommand::Play(need("a url")?)),
            "announce" => Ok(ConsoleCommand::Announce(need("a url")?)),
            other => Err(format!("unknown command {other:?}")),
        }
    }

    pub async fn apply(self, device: &DeviceHandle) -> anyhow::Result<()> {
        match self {
            ConsoleCommand::Start => device.start().await,
            ConsoleCommand::Stop => device.stop().await,
            ConsoleCommand::Host(host) => {
                // the new host is only picked up by a fresh connect
                device.stop().await?;
                device.set_host(host).await?;
                device.start().await
            }
            ConsoleCommand::Volume(volume) => device.set_volume(volume).await,
            ConsoleCommand::Play(url) => device.play_media(url).await,
            ConsoleCommand::Announce(url) => device.play_audio_from_url(url, None).await,
        }
    }
}

/// Read commands from stdin until it closes.
///
/// Lines are read on a plain thread so a pending read never holds up
/// runtime shutdown.
pub async fn run(device: DeviceHandle) {
    let (tx, mut lines) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "console read failed");
                    break;
                }
            }
        }
    });

    info!("⌨️ console ready: start | stop | host <name> | volume <0-1> | play <url> | announce <url>");

    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line) {
            Ok(cmd) => {
                info!(command = ?cmd, "⌨️ console command");
                if let Err(e) = cmd.apply(&device).await {
                    warn!(error = %e, "console command failed");
                    break;
                }
            }
            Err(e) => warn!(input = %line.trim(), "{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_commands() {
        assert_eq!(ConsoleCommand::parse("start"), Ok(ConsoleCommand::Start));
        assert_eq!(ConsoleCommand::parse("  stop "), Ok(ConsoleCommand::Stop));
        assert_eq!(
            ConsoleCommand::parse("host kitchen.local"),
            Ok(ConsoleCommand::Host("kitchen.local".into()))
        );
        assert_eq!(ConsoleCommand::parse("volume 0.25"), Ok(ConsoleCommand::Volume(0.25)));
        assert_eq!(
            ConsoleCommand::parse("play http://10.0.0.2:8000/a.wav"),
            Ok(ConsoleCommand::Play("http://10.0.0.2:8000/a.wav".into()))
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("host").is_err());
        assert!(ConsoleCommand::parse("host a b").is_err());
        assert!(ConsoleCommand::parse("volume loud").is_err());
        assert!(ConsoleCommand::parse("volume 1.5").is_err());
        assert!(ConsoleCommand::parse("reboot").is_err());
    }
}
