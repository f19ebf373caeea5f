//! Host public address lookup via plain-text IP-echo services.

use std::time::Duration;

const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

/// Try each endpoint in order, first success wins. Every endpoint failing
/// is an error; callers that cannot proceed without the address surface it.
pub async fn fetch_public_ip(endpoints: &[String]) -> Result<String, String> {
    let client = reqwest::Client::new();
    for url in endpoints {
        match client.get(url).timeout(ECHO_TIMEOUT).send().await {
            Ok(res) if res.status().is_success() => match res.text().await {
                Ok(body) => {
                    let ip = body.trim().to_string();
                    if !ip.is_empty() {
                        return Ok(ip);
                    }
                    tracing::debug!(url, "empty ip-echo response");
                }
                Err(err) => tracing::debug!(url, error = %err, "ip-echo body unreadable"),
            },
            Ok(res) => {
                tracing::debug!(url, status = res.status().as_u16(), "ip-echo refused")
            }
            Err(err) => tracing::debug!(url, error = %err, "ip-echo unreachable"),
        }
    }
    Err("Could not determine server public address".to_string())
}
