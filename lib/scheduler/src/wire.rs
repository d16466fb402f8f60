//! Lenient serde adapters for the schedules file.
//!
//! Editing surfaces write numeric fields as strings (`"timeInterval": "5"`,
//! `"startHour": "09"`) and blank out unused ones with `""`. These adapters
//! accept numbers or numeric strings, treat blanks as absent, and write the
//! values back in the string form the editors expect.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

fn parse_optional_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(n)) => u32::try_from(n)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("number {n} is out of range"))),
        Some(NumberOrText::Text(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<u32>()
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid number '{trimmed}': {e}")))
        }
    }
}

/// Plain numeric strings (`"15"`).
pub(crate) mod numeric_string {
    use super::*;

    pub(crate) fn serialize<S>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        parse_optional_u32(deserializer)
    }
}

/// Two-digit clock fields (`"09"`, `"05"`).
pub(crate) mod clock_field {
    use super::*;

    pub(crate) fn serialize<S>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_str(&format!("{v:02}")),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        parse_optional_u32(deserializer)
    }
}

/// Calendar dates (`"2025-03-14"`), blank meaning absent.
pub(crate) mod optional_date {
    use super::*;

    const FORMAT: &str = "%Y-%m-%d";

    pub(crate) fn serialize<S>(value: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(date) => serializer.serialize_str(&date.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let Some(text) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        NaiveDate::parse_from_str(trimmed, FORMAT)
            .map(Some)
            .map_err(|e| D::Error::custom(format!("invalid date '{trimmed}': {e}")))
    }
}
