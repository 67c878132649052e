//! External URL redirector process.
//!
//! A configured redirector executable is started once and spoken to over
//! stdin/stdout, one URL per line. A non-empty answer replaces the
//! requested URL before blacklist checks and fetching. Any process error
//! disables redirection for the remaining lifetime of the node rather
//! than failing requests.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use url::Url;

struct RedirectorIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    broken: bool,
}

pub struct Redirector {
    io: Mutex<RedirectorIo>,
}

impl Redirector {
    /// Starts the redirector process.
    pub fn spawn(path: &str) -> std::io::Result<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::other("redirector stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("redirector stdout unavailable")
        })?;
        tracing::info!(path, "redirector process started");
        Ok(Self {
            io: Mutex::new(RedirectorIo {
                child,
                stdin,
                stdout: BufReader::new(stdout),
                broken: false,
            }),
        })
    }

    /// Asks the redirector about `url`. Returns the replacement URL when
    /// the process answers with a different, parseable one.
    pub async fn redirect(&self, url: &Url) -> Option<Url> {
        let mut io = self.io.lock().await;
        if io.broken {
            return None;
        }
        let line = format!("{url}\n");
        if let Err(e) = io.stdin.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "redirector write failed, disabling");
            io.broken = true;
            let _ = io.child.start_kill();
            return None;
        }
        let mut answer = String::new();
        match io.stdout.read_line(&mut answer).await {
            Ok(0) | Err(_) => {
                tracing::warn!("redirector closed its pipe, disabling");
                io.broken = true;
                let _ = io.child.start_kill();
                None
            }
            Ok(_) => {
                let answer = answer.trim();
                if answer.is_empty() || answer == url.as_str() {
                    return None;
                }
                match Url::parse(answer) {
                    Ok(replacement) => {
                        tracing::debug!(from = %url, to = %replacement, "url redirected");
                        Some(replacement)
                    }
                    Err(_) => None,
                }
            }
        }
    }
}
