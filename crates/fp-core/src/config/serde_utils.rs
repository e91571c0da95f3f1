//! Shared serde helpers for configuration

/// `Duration` as whole seconds.
///
/// Serializes to an integer. Deserializes either an integer number of seconds
/// or a short string with a unit suffix (`"90"`, `"30s"`, `"10m"`, `"2h"`).
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Limits {
///     #[serde(with = "fp_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SecsVisitor;

        impl<'de> Visitor<'de> for SecsVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("seconds as an integer or a string like \"10m\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("duration cannot be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                crate::time::parse_period(v)
                    .ok_or_else(|| E::custom(format!("invalid duration '{}'", v)))
            }
        }

        deserializer.deserialize_any(SecsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Limits {
        #[serde(with = "duration_secs")]
        timeout: Duration,
    }

    #[test]
    fn integer_seconds_round_trip() {
        let toml_str = toml::to_string(&Limits {
            timeout: Duration::from_secs(30),
        })
        .unwrap();
        assert_eq!(toml_str.trim(), "timeout = 30");
        let back: Limits = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.timeout, Duration::from_secs(30));
    }

    #[test]
    fn accepts_unit_suffix() {
        let limits: Limits = toml::from_str("timeout = \"10m\"").unwrap();
        assert_eq!(limits.timeout, Duration::from_secs(600));
    }

    #[test]
    fn rejects_garbage() {
        assert!(toml::from_str::<Limits>("timeout = \"soon\"").is_err());
        assert!(toml::from_str::<Limits>("timeout = -4").is_err());
    }
}
