//! Typed records for the Ghibli API's film and people collections, plus the
//! per-record screening applied to every batch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, UpstreamError};

/// One film, as served by `GET /films`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilmRecord {
    /// The film's identifier, as assigned by the partner.
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Release year. The partner serves this as a numeric string; a plain
    /// number is tolerated too.
    #[serde(deserialize_with = "release_year")]
    pub release_date: u16,
}

/// One person, as served by `GET /people`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    /// The person's identifier, as assigned by the partner.
    pub id: Uuid,
    pub name: String,
    /// The films this person appears in. The partner serves these as full
    /// resource URLs with the film UUID as the trailing path segment.
    pub films: Vec<FilmUrl>,
    pub url: String,
}

/// A film resource URL plus the UUID recovered from its trailing path
/// segment, which is the piece the film→people lookup joins on.
///
/// Recovering the UUID from the URL shape is fragile against unannounced
/// partner changes; a batch where it breaks everywhere surfaces as
/// [`UpstreamError::NoParseableRecords`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilmUrl {
    /// The URL exactly as the partner sent it.
    pub url: String,
    /// The film UUID embedded in the URL's last path segment.
    pub uuid: Uuid,
}

impl TryFrom<String> for FilmUrl {
    type Error = uuid::Error;

    fn try_from(url: String) -> Result<Self, Self::Error> {
        let tail = url.rsplit_once('/').map_or(url.as_str(), |(_, tail)| tail);
        let uuid = Uuid::parse_str(tail)?;
        Ok(Self { url, uuid })
    }
}

impl<'de> Deserialize<'de> for FilmUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let url = String::deserialize(deserializer)?;
        Self::try_from(url).map_err(serde::de::Error::custom)
    }
}

impl Serialize for FilmUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Round-trips as the partner's own representation.
        serializer.serialize_str(&self.url)
    }
}

/// Accepts `1988` or `"1988"`.
fn release_year<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Year {
        Number(u16),
        Text(String),
    }

    match Year::deserialize(deserializer)? {
        Year::Number(year) => Ok(year),
        Year::Text(text) => text.parse().map_err(serde::de::Error::custom),
    }
}

/// Screens a raw batch into typed records.
///
/// Individual records that fail to parse are logged as warnings and
/// skipped: partner data is sometimes partially dirty and a proxy that
/// refuses the whole batch over one bad record serves nobody. A *non-empty*
/// batch where nothing parses is different: that is schema drift, and it
/// surfaces as [`UpstreamError::NoParseableRecords`] so the failure trips
/// the same handling as any other partner outage. An empty batch parses to
/// an empty vec.
pub fn screen_records<T>(endpoint: &str, raw: Vec<serde_json::Value>) -> Result<Vec<T>, Error>
where
    T: DeserializeOwned,
{
    let total = raw.len();
    let mut records = Vec::with_capacity(total);

    for value in raw {
        match serde_json::from_value(value) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(endpoint, error = %err, "failed to parse upstream record — skipping");
            }
        }
    }

    if records.is_empty() && total > 0 {
        return Err(UpstreamError::NoParseableRecords {
            endpoint: endpoint.to_owned(),
        }
        .into());
    }

    Ok(records)
}
