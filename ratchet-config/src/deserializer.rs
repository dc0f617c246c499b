pub mod optional_cap {
    use serde::de::{Deserialize, Deserializer};

    /// Accepts `null`, a non-negative count, or `-1` meaning "no cap".
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<i64>::deserialize(deserializer)?;
        Ok(match raw {
            None => None,
            Some(value) if value < 0 => None,
            Some(value) => Some(value as u32),
        })
    }
}
