//! The low-level Ghibli API client.
//!
//! These operations implement no caching: they hit the partner's servers
//! every time they are drained. Call them directly only when you know you
//! want an upstream round trip; everything request-serving goes through the
//! cache registry instead.
//!
//! Every operation yields its records as a lazy, finite stream so the
//! caching layer can treat each record as a separate cache item. Failures
//! anywhere along the way (transport, status, payload decode, or a batch
//! with no parseable records) surface as the partner-unavailable error
//! class ([`UpstreamError`]).

pub mod records;

use futures::StreamExt;
use futures::stream;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cache::FetchStream;
use crate::config::Config;
use crate::error::{Error, UpstreamError};

pub use records::{FilmRecord, FilmUrl, PersonRecord, screen_records};

/// Fields requested for each film; keeps partner payloads lean.
const FILM_FIELDS: &[&str] = &["id", "title", "release_date", "description"];

/// Fields requested for each person.
const PERSON_FIELDS: &[&str] = &["id", "name", "films", "url"];

/// A thin client for the Ghibli API.
///
/// Cloning is cheap (the underlying connection pool is shared), which lets
/// each cache binding capture its own handle.
///
/// # Examples
///
/// ```no_run
/// use futures::StreamExt;
/// use ghibli_proxy::config::Config;
/// use ghibli_proxy::upstream::GhibliClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = GhibliClient::new(&Config::default())?;
/// let mut films = client.all_films();
/// while let Some(film) = films.next().await {
///     println!("{}", film?.title);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct GhibliClient {
    http: reqwest::Client,
    base_url: String,
    retries: u32,
}

impl GhibliClient {
    /// Builds a client from the process configuration.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`reqwest::Error`] if the HTTP client cannot
    /// be constructed (e.g. no usable TLS backend).
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            retries: config.retries,
        })
    }

    /// All films in the partner's filmography:
    /// `GET /films?fields=id,title,release_date,description`.
    pub fn all_films(&self) -> FetchStream<FilmRecord> {
        self.fetch_collection("/films", FILM_FIELDS)
    }

    /// All people across the partner's films:
    /// `GET /people?fields=id,name,films,url`.
    pub fn all_people(&self) -> FetchStream<PersonRecord> {
        self.fetch_collection("/people", PERSON_FIELDS)
    }

    /// One collection endpoint as a record stream: fetch the batch, screen
    /// each record, yield the survivors one at a time.
    fn fetch_collection<T>(&self, endpoint: &'static str, fields: &'static [&'static str]) -> FetchStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        stream::once(async move {
            let raw = client.fetch_batch(endpoint, fields).await?;
            screen_records::<T>(endpoint, raw)
        })
        .flat_map(|batch| match batch {
            Ok(records) => stream::iter(records.into_iter().map(Ok)).left_stream(),
            Err(err) => stream::iter([Err(err)]).right_stream(),
        })
        .boxed()
    }

    /// One GET against a collection endpoint, with bounded transport
    /// retries, returning the raw JSON array.
    async fn fetch_batch(
        &self,
        endpoint: &str,
        fields: &[&str],
    ) -> Result<Vec<serde_json::Value>, Error> {
        let url = format!("{}{}", self.base_url, endpoint);
        let fields = fields.join(",");

        let mut attempt = 0;
        let response = loop {
            let result = self
                .http
                .get(&url)
                .query(&[("fields", fields.as_str())])
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await;

            match result {
                Ok(response) => break response,
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    debug!(endpoint, attempt, error = %err, "upstream request failed — retrying");
                }
                Err(err) => {
                    return Err(UpstreamError::Transport {
                        endpoint: endpoint.to_owned(),
                        source: err,
                    }
                    .into());
                }
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            return Err(UpstreamError::Status {
                endpoint: endpoint.to_owned(),
                status: status.as_u16(),
            }
            .into());
        }

        let body = response.text().await.map_err(|err| UpstreamError::Transport {
            endpoint: endpoint.to_owned(),
            source: err,
        })?;

        serde_json::from_str(&body).map_err(|err| {
            UpstreamError::Payload {
                endpoint: endpoint.to_owned(),
                source: err,
            }
            .into()
        })
    }
}
