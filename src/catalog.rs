//! Game catalog collaborator
//!
//! The engine only asks one question of the catalog: does this game exist? The
//! canonical catalog lives outside the core; `InMemoryCatalog` mirrors it (the
//! runtime fills it from SQLite at startup, see `pipeline::db::load_catalog`).

use crate::locks;
use std::collections::HashSet;
use std::sync::RwLock;

pub trait GameCatalog: Send + Sync {
    fn exists(&self, game: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    games: RwLock<HashSet<String>>,
}

impl InMemoryCatalog {
    pub fn new<I, S>(games: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            games: RwLock::new(games.into_iter().map(Into::into).collect()),
        }
    }

    /// Returns `true` if the game was newly registered.
    pub fn register(&self, game: impl Into<String>) -> bool {
        locks::write(&self.games).insert(game.into())
    }

    pub fn unregister(&self, game: &str) -> bool {
        locks::write(&self.games).remove(game)
    }

    pub fn games(&self) -> Vec<String> {
        let mut games: Vec<String> = locks::read(&self.games).iter().cloned().collect();
        games.sort();
        games
    }

    pub fn len(&self) -> usize {
        locks::read(&self.games).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GameCatalog for InMemoryCatalog {
    fn exists(&self, game: &str) -> bool {
        locks::read(&self.games).contains(game)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let catalog = InMemoryCatalog::new(["g1"]);
        assert!(catalog.exists("g1"));
        assert!(!catalog.exists("g2"));

        assert!(catalog.register("g2"));
        assert!(!catalog.register("g2"));
        assert_eq!(catalog.games(), vec!["g1", "g2"]);

        assert!(catalog.unregister("g1"));
        assert!(!catalog.exists("g1"));
    }
}
