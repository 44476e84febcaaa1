//! Utility functions for clusterkit

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::Argument("empty duration".into()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        let (at, _) = s
            .char_indices()
            .last()
            .ok_or_else(|| crate::Error::Argument("empty duration".into()))?;
        s.split_at(at)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::Argument(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::Argument(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Validate a cluster / ClusterSet name.
///
/// Names end up in lock names, channel names and metadata keys, so they are
/// restricted to `[A-Za-z_][A-Za-z0-9_-]{0,62}`.
pub fn validate_name(kind: &str, name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::Argument(format!("{} name cannot be empty", kind)));
    }

    if name.len() > 63 {
        return Err(crate::Error::Argument(format!(
            "{} name '{}' is too long (max 63 characters)",
            kind, name
        )));
    }

    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(crate::Error::Argument(format!(
            "{} name '{}' contains invalid characters",
            kind, name
        )));
    }

    Ok(())
}

/// Validate an instance address of the form `host:port`
pub fn validate_address(address: &str) -> crate::Result<()> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| crate::Error::Argument(format!("invalid address '{}': expected host:port", address)))?;

    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(crate::Error::Argument(format!(
            "invalid address '{}': bad host",
            address
        )));
    }

    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(crate::Error::Argument(format!(
            "invalid address '{}': bad port",
            address
        ))),
    }
}

/// Budget shared by every wait inside one operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// A tighter deadline: whichever of `self` and `now + limit` comes first
    pub fn min(&self, limit: Duration) -> Self {
        let candidate = Instant::now() + limit;
        Self {
            at: self.at.min(candidate),
        }
    }
}

/// Poll `check` every `interval` until it yields `Some`, failing with
/// [`crate::Error::Timeout`] once `deadline` passes.
pub async fn poll_until<F, Fut, T>(
    what: &str,
    deadline: Deadline,
    interval: Duration,
    mut check: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<Option<T>>>,
{
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if deadline.expired() {
            return Err(crate::Error::Timeout(format!("waiting for {}", what)));
        }
        tokio::time::sleep(interval.min(deadline.remaining())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("5µ").is_err());
        assert!(parse_duration("µ").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("cluster", "prod_east-1").is_ok());
        assert!(validate_name("cluster", "_c").is_ok());
        assert!(validate_name("cluster", "").is_err());
        assert!(validate_name("cluster", "1abc").is_err());
        assert!(validate_name("cluster", "a b").is_err());
        assert!(validate_name("cluster", &"x".repeat(64)).is_err());
    }

    #[test]
    fn test_validate_address() {
        assert!(validate_address("db1:3306").is_ok());
        assert!(validate_address("10.0.0.1:33060").is_ok());
        assert!(validate_address("db1").is_err());
        assert!(validate_address(":3306").is_err());
        assert!(validate_address("db1:0").is_err());
        assert!(validate_address("db1:port").is_err());
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let deadline = Deadline::after(Duration::from_millis(30));
        let res: crate::Result<()> =
            poll_until("never", deadline, Duration::from_millis(5), || async { Ok(None) }).await;
        assert!(matches!(res, Err(crate::Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_poll_until_succeeds() {
        let calls = AtomicUsize::new(0);
        let deadline = Deadline::after(Duration::from_secs(1));
        let value = poll_until("third call", deadline, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if n >= 2 { Some(n) } else { None }) }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
    }
}
