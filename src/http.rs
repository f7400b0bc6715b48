use crate::config::HttpSettings;
use reqwest::Client;

/// Every outbound provider call goes through a client carrying both timeouts;
/// a timeout surfaces as an ordinary request error.
pub fn build_client(settings: &HttpSettings) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(settings.timeout)
        .connect_timeout(settings.connect_timeout)
        .build()
}

/// Provider bodies can be large HTML error pages; keep log lines bounded.
pub fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
