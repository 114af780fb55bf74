//! Worker models (execution environment templates).

use serde::{Deserialize, Serialize};

use crate::{GroupId, ModelId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerModel {
    pub id: ModelId,
    pub name: String,
    pub group_id: GroupId,
}

impl WorkerModel {
    /// A model is usable by its own group, and by everyone when it belongs to
    /// the shared infrastructure group. Workers of the shared group may run
    /// any model.
    pub fn usable_by(&self, group_id: GroupId, shared_group: Option<GroupId>) -> bool {
        self.group_id == group_id
            || shared_group.is_some_and(|shared| shared == self.group_id || shared == group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_access() {
        let own = GroupId::new();
        let other = GroupId::new();
        let shared = GroupId::new();
        let model = WorkerModel {
            id: ModelId::new(),
            name: "debian12".to_string(),
            group_id: own,
        };
        assert!(model.usable_by(own, None));
        assert!(!model.usable_by(other, None));
        assert!(!model.usable_by(other, Some(shared)));
        assert!(model.usable_by(shared, Some(shared)));

        let public = WorkerModel {
            group_id: shared,
            ..model
        };
        assert!(public.usable_by(other, Some(shared)));
    }
}
