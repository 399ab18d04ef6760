//! Application wiring: cache bindings and the domain queries the HTTP
//! handlers serve.
//!
//! [`App`] is built once at startup. It constructs the upstream client,
//! binds both fetch operations into a [`CacheRegistry`] (the people binding
//! carries the film→people lookup rebuild as its post-update callback),
//! and then answers collection queries through the cache for the rest of
//! the process lifetime.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::cache::{CacheRegistry, FetchOp, UpdateCallback, UpsertCache};
use crate::config::Config;
use crate::error::Error;
use crate::lookup::FilmPeopleLookup;
use crate::upstream::{FilmRecord, GhibliClient, PersonRecord};

/// The films fetch operation — one cache item per film, keyed by film id.
pub const ALL_FILMS: FetchOp<Uuid, FilmRecord> = FetchOp::new("all_films");

/// The people fetch operation — one cache item per person, keyed by person
/// id.
pub const ALL_PEOPLE: FetchOp<Uuid, PersonRecord> = FetchOp::new("all_people");

/// A film joined with the people known to appear in it.
#[derive(Debug, Clone, Serialize)]
pub struct FilmPeople {
    pub film: FilmRecord,
    pub people: Vec<PersonRecord>,
}

/// Process-wide application state.
pub struct App {
    registry: CacheRegistry,
    lookup: Arc<FilmPeopleLookup>,
}

impl App {
    /// Wires the upstream client, the cache bindings, and the derived
    /// lookup.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`reqwest::Error`] if the HTTP client cannot
    /// be constructed.
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = GhibliClient::new(config)?;
        let lookup = Arc::new(FilmPeopleLookup::new());
        let mut registry = CacheRegistry::new();

        let films_client = client.clone();
        registry.bind(
            &ALL_FILMS,
            move || films_client.all_films(),
            config.cache_ttl,
            |film: &FilmRecord| film.id,
            Vec::new(),
        );

        let people_client = client;
        let rebuild = {
            let lookup = Arc::clone(&lookup);
            Box::new(move |cache: &UpsertCache<Uuid, PersonRecord>| lookup.rebuild_from(cache))
                as UpdateCallback<Uuid, PersonRecord>
        };
        registry.bind(
            &ALL_PEOPLE,
            move || people_client.all_people(),
            config.cache_ttl,
            |person: &PersonRecord| person.id,
            vec![rebuild],
        );

        Ok(Self { registry, lookup })
    }

    /// The cache registry, for introspection and tests.
    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    /// All films, served through the cache, ordered by release year then
    /// title.
    pub async fn films(&self) -> Result<Vec<FilmRecord>, Error> {
        let view = self
            .registry
            .request_through_cache(&ALL_FILMS, true, None)
            .await?;
        let mut films: Vec<_> = view.values().cloned().collect();
        films.sort_by(|a, b| {
            a.release_date
                .cmp(&b.release_date)
                .then_with(|| a.title.cmp(&b.title))
        });
        Ok(films)
    }

    /// All people, served through the cache, ordered by name.
    pub async fn people(&self) -> Result<Vec<PersonRecord>, Error> {
        let view = self
            .registry
            .request_through_cache(&ALL_PEOPLE, true, None)
            .await?;
        let mut people: Vec<_> = view.values().cloned().collect();
        people.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(people)
    }

    /// One film joined with its people via the derived lookup, or `None`
    /// when the film id is unknown.
    ///
    /// The people collection is requested before the lookup is read: the
    /// lookup rebuild rides on the people cache's update callback.
    pub async fn film_people(&self, film_id: Uuid) -> Result<Option<FilmPeople>, Error> {
        let films = self
            .registry
            .request_through_cache(&ALL_FILMS, true, None)
            .await?;
        let Some(film) = films.get(&film_id).cloned() else {
            return Ok(None);
        };

        let people_view = self
            .registry
            .request_through_cache(&ALL_PEOPLE, true, None)
            .await?;

        let mut people: Vec<_> = self
            .lookup
            .people_of(&film_id)
            .into_iter()
            .filter_map(|person_id| people_view.get(&person_id).cloned())
            .collect();
        people.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Some(FilmPeople { film, people }))
    }
}
