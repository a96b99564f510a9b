//! # STDIN COMMAND LINE
//!
//! A minimal stand-in for the (out-of-scope) IPC transport — one line of
//! text per `Command`, one line of `Debug`-formatted `Response` back on
//! stdout. Reachable and real, unlike leaving `Command`/`Response`
//! unwired; not meant to be the daemon's eventual public surface.

use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use std::thread;

use mc_core::{Channel, Command, PauseReason, Response};

/// Spawns a thread that reads commands from stdin and writes each
/// `Response` back to stdout once the main loop answers it. Returns the
/// receiving end the main loop drains every tick.
pub fn spawn_stdin_reader() -> mpsc::Receiver<(Command, mpsc::Sender<Response>)> {
  let (tx, rx) = mpsc::channel();
  thread::spawn(move || {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
      let Ok(line) = line else { break };
      let Some(command) = parse_command(&line) else {
        if !line.trim().is_empty() {
          println!("ERR unrecognised command: {line}");
          let _ = io::stdout().flush();
        }
        continue;
      };
      let (reply_tx, reply_rx) = mpsc::channel();
      if tx.send((command, reply_tx)).is_err() {
        break;
      }
      if let Ok(response) = reply_rx.recv() {
        println!("{response:?}");
        let _ = io::stdout().flush();
      }
    }
  });
  rx
}

fn parse_command(line: &str) -> Option<Command> {
  let mut parts = line.trim().split_whitespace();
  let verb = parts.next()?;
  let rest: Vec<&str> = parts.collect();
  match verb.to_ascii_uppercase().as_str() {
    "SELECT" => {
      let name = (*rest.first()?).to_string();
      let simulating = matches!(rest.get(1), Some(&"sim"));
      Some(Command::SelectFile { name, simulating })
    }
    "START" => Some(Command::StartPrint),
    "PAUSE" => Some(Command::Pause {
      offset: rest.first().and_then(|s| s.parse().ok()),
      reason: PauseReason::User,
    }),
    "RESUME" => Some(Command::Resume),
    "CANCEL" => Some(Command::Cancel),
    "ABORT" => Some(Command::Abort),
    "POSITION" => Some(Command::GetFilePosition),
    "SEEK" => Some(Command::SetFilePosition(rest.first()?.parse().ok()?)),
    "FLUSH" => Some(Command::FlushChannel(parse_channel(rest.first()?)?)),
    "CODE" => {
      let channel = parse_channel(rest.first()?)?;
      let code_text = line.trim().splitn(3, char::is_whitespace).nth(2)?.to_string();
      Some(Command::SimpleCode { channel, code_text })
    }
    "OM" => Some(Command::ReadObjectModel {
      path: rest.first().copied().unwrap_or("").to_string(),
    }),
    _ => None,
  }
}

fn parse_channel(name: &str) -> Option<Channel> {
  Some(match name.to_ascii_lowercase().as_str() {
    "http" => Channel::Http,
    "telnet" => Channel::Telnet,
    "file" => Channel::File,
    "usb" => Channel::Usb,
    "aux" => Channel::Aux,
    "trigger" => Channel::Trigger,
    "queue" => Channel::Queue,
    "lcd" => Channel::Lcd,
    "sbc" => Channel::Sbc,
    "daemon" => Channel::Daemon,
    "autopause" => Channel::AutoPause,
    _ => return None,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_select_with_simulating_flag() {
    let command = parse_command("select foo.g sim").unwrap();
    assert!(matches!(command, Command::SelectFile { name, simulating: true } if name == "foo.g"));
  }

  #[test]
  fn parses_select_without_simulating_flag() {
    let command = parse_command("select foo.g").unwrap();
    assert!(matches!(command, Command::SelectFile { simulating: false, .. }));
  }

  #[test]
  fn parses_code_preserving_the_remainder_of_the_line() {
    let command = parse_command("code http M105 S1").unwrap();
    match command {
      Command::SimpleCode { channel, code_text } => {
        assert_eq!(channel, Channel::Http);
        assert_eq!(code_text, "M105 S1");
      }
      other => panic!("unexpected command: {other:?}"),
    }
  }

  #[test]
  fn unrecognised_verb_is_rejected() {
    assert!(parse_command("frobnicate").is_none());
  }

  #[test]
  fn blank_line_is_rejected() {
    assert!(parse_command("").is_none());
  }
}
