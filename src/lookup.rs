//! The derived film → people lookup.
//!
//! The partner's data relates people to films, not films to people; this
//! module maintains the inverted index the `/films/{id}/people` join needs.
//! It is rebuilt in full by a callback on the people cache's binding, an
//! O(people × films-per-person) sweep, which is exactly why it hangs off
//! cache updates instead of running per request.
//!
//! The index is owned by the application context and handed to the callback
//! behind an [`Arc`]; no module-level global. Like the caches it derives
//! from, it only ever grows: people are never removed from films, and films
//! are never un-released.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use uuid::Uuid;

use crate::cache::UpsertCache;
use crate::upstream::PersonRecord;

/// Film UUID → the set of people appearing in that film.
#[derive(Debug, Default)]
pub struct FilmPeopleLookup {
    map: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl FilmPeopleLookup {
    /// Creates an empty lookup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-derives the index from the people cache's current snapshot.
    ///
    /// Entries accumulate: a person already indexed under a film stays
    /// there, and film keys are never dropped. Intended to run as a
    /// post-update callback on the people cache.
    pub fn rebuild_from(&self, people: &UpsertCache<Uuid, PersonRecord>) {
        let snapshot = people.all();
        let mut map = self.map.write().expect("lookup lock poisoned");
        for person in snapshot.values() {
            for film in &person.films {
                map.entry(film.uuid).or_default().insert(person.id);
            }
        }
    }

    /// The people known to appear in `film`. Empty when the film is unknown
    /// or has no indexed people.
    pub fn people_of(&self, film: &Uuid) -> HashSet<Uuid> {
        let map = self.map.read().expect("lookup lock poisoned");
        map.get(film).cloned().unwrap_or_default()
    }

    /// Number of films with at least one indexed person.
    pub fn len(&self) -> usize {
        self.map.read().expect("lookup lock poisoned").len()
    }

    /// `true` if no film has been indexed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::upstream::FilmUrl;

    fn person(id: Uuid, film_ids: &[Uuid]) -> PersonRecord {
        PersonRecord {
            id,
            name: "someone".to_owned(),
            films: film_ids
                .iter()
                .map(|film_id| {
                    FilmUrl::try_from(format!("https://example.com/films/{film_id}")).unwrap()
                })
                .collect(),
            url: format!("https://example.com/people/{id}"),
        }
    }

    fn people_cache(people: Vec<PersonRecord>) -> UpsertCache<Uuid, PersonRecord> {
        let cache = UpsertCache::new(Duration::from_secs(60));
        cache.update(people.into_iter().map(|p| (p.id, p)).collect::<HashMap<_, _>>());
        cache
    }

    #[test]
    fn rebuild_inverts_the_relation() {
        let film_a = Uuid::new_v4();
        let film_b = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let cache = people_cache(vec![
            person(alice, &[film_a, film_b]),
            person(bob, &[film_b]),
        ]);

        let lookup = FilmPeopleLookup::new();
        lookup.rebuild_from(&cache);

        assert_eq!(lookup.people_of(&film_a), HashSet::from([alice]));
        assert_eq!(lookup.people_of(&film_b), HashSet::from([alice, bob]));
        assert_eq!(lookup.len(), 2);
    }

    #[test]
    fn unknown_film_has_no_people() {
        let lookup = FilmPeopleLookup::new();
        assert!(lookup.people_of(&Uuid::new_v4()).is_empty());
        assert!(lookup.is_empty());
    }

    #[test]
    fn rebuilds_only_accumulate() {
        let film = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let lookup = FilmPeopleLookup::new();
        lookup.rebuild_from(&people_cache(vec![person(alice, &[film])]));

        // A later snapshot without alice still leaves her indexed.
        lookup.rebuild_from(&people_cache(vec![person(bob, &[film])]));

        assert_eq!(lookup.people_of(&film), HashSet::from([alice, bob]));
    }

    #[test]
    fn works_as_an_update_callback() {
        let film = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let lookup = std::sync::Arc::new(FilmPeopleLookup::new());

        let callback = {
            let lookup = std::sync::Arc::clone(&lookup);
            Box::new(move |cache: &UpsertCache<Uuid, PersonRecord>| lookup.rebuild_from(cache))
                as crate::cache::UpdateCallback<Uuid, PersonRecord>
        };

        let cache = UpsertCache::with_callbacks(Duration::from_secs(60), vec![callback]);
        cache.update(HashMap::from([(alice, person(alice, &[film]))]));

        assert_eq!(lookup.people_of(&film), HashSet::from([alice]));
    }
}
