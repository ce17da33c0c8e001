use std::collections::{BTreeSet, HashMap};

use crate::dataset::{BackendKind, EntitySpec};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("entity `{0}` is declared more than once")]
    DuplicateEntity(String),
    #[error("entity `{entity}` references unknown entity `{references}`")]
    UnknownReference { entity: String, references: String },
    #[error("foreign-key dependency cycle between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
}

/// Entities of one backend family in the order they must be loaded:
/// every referenced entity precedes the entities referencing it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    kind: BackendKind,
    entities: Vec<EntitySpec>,
}

impl LoadPlan {
    /// Orders the entities having an encoding for `kind` by their foreign-key
    /// dependencies. Independent entities keep their declaration order.
    pub fn for_backend(kind: BackendKind, entities: &[EntitySpec]) -> Result<Self, PlanError> {
        let ordered = dependency_order(entities)?;
        let entities = ordered
            .into_iter()
            .filter(|entity| entity.has_encoding(kind))
            .cloned()
            .collect();
        Ok(LoadPlan { kind, entities })
    }

    /// Plan taking the given order as is, whether or not it honours the
    /// dependencies. Lets driver tests replay a load in an explicit order.
    #[doc(hidden)]
    pub fn in_given_order(kind: BackendKind, entities: Vec<EntitySpec>) -> Self {
        LoadPlan { kind, entities }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn load_order(&self) -> impl DoubleEndedIterator<Item = &EntitySpec> {
        self.entities.iter()
    }

    /// Children before parents, the order for truncation.
    pub fn reset_order(&self) -> impl Iterator<Item = &EntitySpec> {
        self.entities.iter().rev()
    }

    pub fn find(&self, name: &str) -> Option<&EntitySpec> {
        self.entities.iter().find(|entity| entity.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Entities of this plan that depend on `failed`, directly or through
    /// other entities.
    pub fn dependents_of(&self, failed: &str) -> BTreeSet<String> {
        let mut dependents = BTreeSet::new();
        let mut frontier = vec![failed.to_owned()];
        while let Some(parent) = frontier.pop() {
            for entity in &self.entities {
                if entity.references().any(|r| r == parent) && dependents.insert(entity.name.clone()) {
                    frontier.push(entity.name.clone());
                }
            }
        }
        dependents
    }
}

/// Kahn's algorithm over the tabular foreign keys, stable with respect to
/// declaration order.
pub fn dependency_order(entities: &[EntitySpec]) -> Result<Vec<&EntitySpec>, PlanError> {
    let mut index = HashMap::with_capacity(entities.len());
    for (i, entity) in entities.iter().enumerate() {
        if index.insert(entity.name.as_str(), i).is_some() {
            return Err(PlanError::DuplicateEntity(entity.name.clone()));
        }
    }

    let mut pending_parents = vec![0usize; entities.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); entities.len()];
    for (i, entity) in entities.iter().enumerate() {
        let parents: BTreeSet<&str> = entity.references().collect();
        for parent in parents {
            // Self references do not constrain the order of whole-table loads.
            if parent == entity.name {
                continue;
            }
            let Some(&p) = index.get(parent) else {
                return Err(PlanError::UnknownReference {
                    entity: entity.name.clone(),
                    references: parent.to_owned(),
                });
            };
            pending_parents[i] += 1;
            children[p].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..entities.len())
        .filter(|&i| pending_parents[i] == 0)
        .collect();
    let mut ordered = Vec::with_capacity(entities.len());
    while let Some(i) = ready.pop_first() {
        ordered.push(&entities[i]);
        for &child in &children[i] {
            pending_parents[child] -= 1;
            if pending_parents[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if ordered.len() != entities.len() {
        let cycle = (0..entities.len())
            .filter(|&i| pending_parents[i] > 0)
            .map(|i| entities[i].name.clone())
            .collect();
        return Err(PlanError::DependencyCycle(cycle));
    }
    Ok(ordered)
}
