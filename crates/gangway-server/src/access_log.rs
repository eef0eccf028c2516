//! Access logging.
//!
//! Every filesystem-facing request is recorded as one CSV line with the
//! connection it came from. Producers hand lines to a single writer task
//! over a channel, so output stays strictly ordered no matter how many
//! sessions log concurrently. Logging is best-effort: a closed or failing
//! writer never fails the operation that logged.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Who a log entry is about. Created once at session start and passed
/// immutably into every filesystem operation.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub username: String,
    pub remote_ip: String,
}

/// Clonable handle to the access log writer task.
#[derive(Debug, Clone)]
pub struct AccessLog {
    tx: mpsc::Sender<String>,
}

impl AccessLog {
    /// Log to standard output.
    pub fn stdout() -> Self {
        Self::to_writer(tokio::io::stdout())
    }

    /// Log to an arbitrary writer. The writer task drains the channel in
    /// order and stops when every handle is dropped.
    pub fn to_writer(mut writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });
        Self { tx }
    }

    pub async fn login(&self, info: &ConnectionInfo, status: &str) {
        self.emit("login", info, "", "", status).await;
    }

    pub async fn logout(&self, info: &ConnectionInfo) {
        self.emit("logout", info, "", "", "").await;
    }

    /// One entry per filesystem-facing request:
    /// status is `ok`, `forbidden` or `error`.
    pub async fn access(&self, info: &ConnectionInfo, path: &str, op: &str, status: &str) {
        self.emit("access", info, path, op, status).await;
    }

    async fn emit(&self, kind: &str, info: &ConnectionInfo, path: &str, op: &str, status: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f %:z");
        let line = format!(
            "{},{},{},{},{},{},{}\n",
            quote(&timestamp.to_string()),
            quote(kind),
            quote(&info.remote_ip),
            quote(&info.username),
            quote(path),
            quote(op),
            quote(status),
        );
        // Best-effort: a full or closed channel drops the line.
        let _ = self.tx.send(line).await;
    }
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn lines_are_quoted_and_ordered() {
        let (read_side, write_side) = tokio::io::duplex(4096);
        let log = AccessLog::to_writer(write_side);
        let info = ConnectionInfo {
            username: "amy".to_string(),
            remote_ip: "10.0.0.7:4022".to_string(),
        };

        log.login(&info, "granted").await;
        log.access(&info, "/docs/x.txt", "Read", "ok").await;
        log.access(&info, "/se\"cret", "Stat", "forbidden").await;
        log.logout(&info).await;
        drop(log);

        let mut out = String::new();
        let mut read_side = read_side;
        read_side.read_to_string(&mut out).await.unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("\"login\""));
        assert!(lines[0].contains("\"granted\""));
        assert!(lines[1].contains("\"access\""));
        assert!(lines[1].contains("\"/docs/x.txt\""));
        assert!(lines[1].contains("\"Read\",\"ok\""));
        // Embedded quotes are doubled.
        assert!(lines[2].contains("\"/se\"\"cret\""));
        assert!(lines[3].contains("\"logout\""));
    }

    #[tokio::test]
    async fn logging_after_writer_death_is_silent() {
        let (read_side, write_side) = tokio::io::duplex(64);
        let log = AccessLog::to_writer(write_side);
        drop(read_side);
        let info = ConnectionInfo {
            username: "u".to_string(),
            remote_ip: "ip".to_string(),
        };
        // Must not panic or error.
        for _ in 0..8 {
            log.access(&info, "/p", "Read", "ok").await;
        }
    }
}
