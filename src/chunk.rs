//! Chunk boundaries and the chunk executor

use std::ops::Range;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::model::{ChunkResult, RecipientResult, SendingSettings};
use crate::transport::{EmailTransport, OutboundEmail};

/// Number of chunks needed for `total` recipients, `ceil(total / chunk_size)`
pub fn total_chunks(total: usize, chunk_size: usize) -> usize {
    total.div_ceil(chunk_size.max(1))
}

/// Slice boundaries of chunk `index`, `None` past the last chunk.
/// The last chunk may be shorter than `chunk_size`.
pub fn chunk_range(total: usize, chunk_size: usize, index: usize) -> Option<Range<usize>> {
    let size = chunk_size.max(1);
    let start = index.checked_mul(size)?;
    if start >= total {
        return None;
    }
    Some(start..(start + size).min(total))
}

/// Sends `html` to every recipient of the slice, in order
///
/// Each delivery is bounded by `settings.email_timeout_ms`. A failure or timeout is
/// recorded for that recipient and the chunk carries on with the next one, so the
/// call always completes with one result per recipient.
pub async fn process_sending_chunk(
    transport: &dyn EmailTransport,
    settings: &SendingSettings,
    recipients: &[String],
    html: &str,
    subject: &str,
) -> ChunkResult {
    let limit = Duration::from_millis(settings.email_timeout_ms);
    let mut results = Vec::with_capacity(recipients.len());

    for email in recipients {
        let message = OutboundEmail::new(settings, email, subject, html);
        let outcome = match timeout(limit, transport.send_email(&message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("timed out after {}ms", settings.email_timeout_ms)),
        };

        match outcome {
            Ok(()) => {
                debug!(to = %email, "recipient sent");
                results.push(RecipientResult {
                    email: email.clone(),
                    success: true,
                    error: None,
                });
            }
            Err(error) => {
                warn!(to = %email, %error, "recipient failed");
                results.push(RecipientResult {
                    email: email.clone(),
                    success: false,
                    error: Some(error),
                });
            }
        }
    }

    let sent_count = results.iter().filter(|r| r.success).count();
    ChunkResult {
        sent_count,
        failed_count: results.len() - sent_count,
        completed_at: Utc::now(),
        results,
    }
}
