//! Draining build, push and pull progress streams.

use std::collections::VecDeque;

use keel_docker::{parse_chunk, ProgressStream};
use tracing::error;

use crate::build_log::AppBuildLog;

/// Stream lines kept for context when a pull fails.
const PULL_CONTEXT_LINES: usize = 20;

/// Mirror a build or push stream into the build log.
///
/// Returns the accumulated error text if any chunk carried an error.
pub(crate) async fn drain_logged(mut rx: ProgressStream, log: &AppBuildLog) -> Result<(), String> {
    let mut error_message = String::new();
    while let Some(chunk) = rx.recv().await {
        let raw = match chunk {
            Ok(raw) => raw,
            Err(e) => {
                error_message.push_str(&e.to_string());
                continue;
            }
        };
        for entry in parse_chunk(&raw) {
            if let Some(stream) = &entry.stream {
                log.log(stream);
            }
            if let Some(err) = &entry.error {
                let detail = entry.error_detail_json();
                error!(app = %log.app(), error = %err, %detail, "image operation reported an error");
                log.log(&detail);
                log.log(err);
                error_message.push('\n');
                error_message.push_str(&detail);
                error_message.push('\n');
                error_message.push_str(err);
            }
        }
    }
    if error_message.is_empty() {
        Ok(())
    } else {
        Err(error_message)
    }
}

/// Drain a pull stream. Output is not logged; on error the last few
/// stream lines are folded into the error text.
pub(crate) async fn drain_pull(mut rx: ProgressStream) -> Result<(), String> {
    let mut error_message = String::new();
    let mut recent: VecDeque<String> = VecDeque::from(vec![String::new(); PULL_CONTEXT_LINES]);
    while let Some(chunk) = rx.recv().await {
        let raw = match chunk {
            Ok(raw) => raw,
            Err(e) => {
                error_message.push_str(&e.to_string());
                continue;
            }
        };
        for entry in parse_chunk(&raw) {
            if let Some(stream) = &entry.stream {
                recent.pop_front();
                recent.push_back(stream.clone());
            }
            if let Some(err) = &entry.error {
                error!(error = %err, detail = %entry.error_detail_json(), "pull reported an error");
                error_message.push_str("\n [truncated] \n");
                error_message.extend(recent.iter().map(String::as_str));
                error_message.push('\n');
                error_message.push_str(err);
            }
        }
    }
    if error_message.is_empty() {
        Ok(())
    } else {
        Err(error_message)
    }
}
