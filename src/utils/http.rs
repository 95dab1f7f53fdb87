use futures_util::StreamExt;

/// Error bodies are diagnostics only: a body that fails mid-stream keeps
/// whatever arrived.
pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let mut bytes = Vec::new();
    let truncated = read_body_limited(response, max_bytes, &mut bytes)
        .await
        .unwrap_or(false);
    let mut body = String::from_utf8_lossy(&bytes).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

/// Reads at most `max_bytes` of the body. Stream failures (timeouts, resets)
/// are returned, never folded into a short body.
pub(crate) async fn response_bytes_limited(
    response: reqwest::Response,
    max_bytes: usize,
) -> Result<(Vec<u8>, bool), reqwest::Error> {
    let mut out = Vec::new();
    let truncated = read_body_limited(response, max_bytes, &mut out).await?;
    Ok((out, truncated))
}

async fn read_body_limited(
    response: reqwest::Response,
    max_bytes: usize,
    out: &mut Vec<u8>,
) -> Result<bool, reqwest::Error> {
    let max_bytes = max_bytes.max(1);
    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let chunk = next?;
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            return Ok(true);
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            return Ok(true);
        }
    }
    Ok(false)
}

/// Cuts `text` to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::truncate_chars;

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("sk-abcdefghijk", 8), "sk-abcde...");
        assert_eq!(truncate_chars("short", 8), "short");
        assert_eq!(truncate_chars("ééééééééé", 8), "éééééééé...");
    }
}
