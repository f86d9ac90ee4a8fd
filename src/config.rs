use std::time::Duration;

use crate::{Error, Result};

/// A value in a queue-declare argument table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Long(i64),
    Str(String),
}

/// Which backing queue a mirrored queue selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaPolicy {
    All,
}

/// Validated queue arguments.
///
/// Unknown keys are ignored so clients can carry vendor extensions; known
/// keys with the wrong type or range are rejected at declare time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArgs {
    /// `x-expires`: drop the queue after this long without use (ms > 0).
    pub expires: Option<Duration>,
    /// `x-message-ttl`: per-queue message time-to-live (ms >= 0).
    pub message_ttl: Option<Duration>,
    /// `x-ha-policy`: selects the mirrored backing queue.
    pub ha_policy: Option<HaPolicy>,
}

impl QueueArgs {
    pub fn parse(table: &[(String, ArgValue)]) -> Result<Self> {
        let mut args = QueueArgs::default();
        for (key, value) in table {
            match key.as_str() {
                "x-expires" => {
                    let ms = long_arg(key, value)?;
                    if ms <= 0 {
                        return Err(Error::config(key, "must be > 0"));
                    }
                    args.expires = Some(Duration::from_millis(ms as u64));
                }
                "x-message-ttl" => {
                    let ms = long_arg(key, value)?;
                    if ms < 0 {
                        return Err(Error::config(key, "must be >= 0"));
                    }
                    args.message_ttl = Some(Duration::from_millis(ms as u64));
                }
                "x-ha-policy" => match value {
                    ArgValue::Str(s) if s == "all" => args.ha_policy = Some(HaPolicy::All),
                    ArgValue::Str(s) => {
                        return Err(Error::config(key, format!("unknown policy {s:?}")))
                    }
                    ArgValue::Long(_) => return Err(Error::config(key, "expected a string")),
                },
                _ => {}
            }
        }
        Ok(args)
    }
}

fn long_arg(key: &str, value: &ArgValue) -> Result<i64> {
    match value {
        ArgValue::Long(n) => Ok(*n),
        ArgValue::Str(_) => Err(Error::config(key, "expected an integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, ArgValue)]) -> Vec<(String, ArgValue)> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn parses_known_keys() {
        let args = QueueArgs::parse(&table(&[
            ("x-expires", ArgValue::Long(9000)),
            ("x-message-ttl", ArgValue::Long(100)),
            ("x-ha-policy", ArgValue::Str("all".into())),
        ]))
        .unwrap();
        assert_eq!(args.expires, Some(Duration::from_millis(9000)));
        assert_eq!(args.message_ttl, Some(Duration::from_millis(100)));
        assert_eq!(args.ha_policy, Some(HaPolicy::All));
    }

    #[test]
    fn rejects_bad_types_and_ranges() {
        assert!(QueueArgs::parse(&table(&[("x-expires", ArgValue::Long(0))])).is_err());
        assert!(QueueArgs::parse(&table(&[("x-message-ttl", ArgValue::Long(-1))])).is_err());
        assert!(
            QueueArgs::parse(&table(&[("x-expires", ArgValue::Str("soon".into()))])).is_err()
        );
        assert!(
            QueueArgs::parse(&table(&[("x-ha-policy", ArgValue::Str("some".into()))])).is_err()
        );
    }

    #[test]
    fn ignores_unknown_keys() {
        let args =
            QueueArgs::parse(&table(&[("x-vendor-thing", ArgValue::Long(7))])).unwrap();
        assert_eq!(args, QueueArgs::default());
    }
}
