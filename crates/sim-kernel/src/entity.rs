//! Entities
//!
//! Anything with an identity. Entities mint the identities of the entities
//! they create, so the creation order alone decides every identity.

use serde::{Deserialize, Serialize};
use sim_types::{Digit, Identity};

/// A named node in the entity tree with a counter of children created.
#[derive(Debug, Serialize, Deserialize)]
pub struct Entity {
    identity: Identity,
    children_created: Digit,
}

impl Entity {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            children_created: 0,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Number of child identities minted so far.
    pub fn children_created(&self) -> Digit {
        self.children_created
    }

    /// Mints the identity of the next child: `self.identity ++ [n]`.
    ///
    /// # Panics
    ///
    /// Exhausting the digit space of one entity is unrecoverable: identities
    /// would repeat, so the process aborts instead.
    pub fn create_child(&mut self) -> Identity {
        let digit = self.children_created;
        match digit.checked_add(1) {
            Some(next) => self.children_created = next,
            None => {
                tracing::error!(entity = %self.identity, "identity space exhausted");
                panic!("entity {} cannot create more children", self.identity);
            }
        }
        self.identity.child(digit)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Entity {}
