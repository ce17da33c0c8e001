use serde::{
    Deserializer,
    de::{self, Visitor},
};

/// Accepts a number of seconds or a string with a `ms`, `s` or `m` suffix.
pub struct DurationVisitor;

impl<'de> Visitor<'de> for DurationVisitor {
    type Value = std::time::Duration;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a number of seconds or a string like \"500ms\", \"2s\", \"1m\"")
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        let secs = u64::try_from(value).map_err(|_| E::custom("duration must not be negative"))?;
        Ok(std::time::Duration::from_secs(secs))
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(std::time::Duration::from_secs(value))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        parse(value).ok_or_else(|| E::invalid_value(de::Unexpected::Str(value), &self))
    }
}

fn parse(value: &str) -> Option<std::time::Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount.parse().ok()?;
    match unit.trim() {
        "" | "s" => Some(std::time::Duration::from_secs(amount)),
        "ms" => Some(std::time::Duration::from_millis(amount)),
        "m" => Some(std::time::Duration::from_secs(amount.checked_mul(60)?)),
        _ => None,
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<std::time::Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(DurationVisitor)
}
