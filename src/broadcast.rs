use crate::registry::{BroadcastReport, ClientRegistry};

/// Line ending the board expects, whatever the local platform produces.
pub const LINE_ENDING: &str = "\r\n";

/// Rewrite a bare `\n` (POSIX Enter) or `\r` (Windows Enter) to `\r\n`.
pub fn normalize(ch: &str) -> &str {
    match ch {
        "\n" | "\r" => LINE_ENDING,
        other => other,
    }
}

/// Sends typed characters to every connected client.
#[derive(Clone)]
pub struct Broadcaster {
    registry: ClientRegistry,
}

impl Broadcaster {
    pub fn new(registry: ClientRegistry) -> Self {
        Self { registry }
    }

    /// Normalize `ch` and send it to every registered client.
    ///
    /// Clients whose send fails are dropped from the registry and listed in
    /// the report; delivery to the others is unaffected.
    pub async fn user_input(&self, ch: &str) -> BroadcastReport {
        if ch.is_empty() {
            return BroadcastReport::default();
        }
        tracing::debug!(input = ?ch, "received");

        let payload = normalize(ch);
        let report = self.registry.send_all(payload.as_bytes()).await;
        for failure in &report.failed {
            tracing::warn!(
                connection = %failure.id,
                peer = %failure.peer,
                error = %failure.error,
                "send failed, client dropped"
            );
        }
        report
    }

    /// Convenience wrapper for a single decoded character.
    pub async fn send_char(&self, ch: char) -> BroadcastReport {
        let mut buf = [0u8; 4];
        self.user_input(ch.encode_utf8(&mut buf)).await
    }
}
