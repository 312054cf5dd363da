//! Live tokens and the token manager
//!
//! A [`Token`] is a row instance on one DAG path: the audit identity plus
//! the row data it currently carries. The [`TokenManager`] constructs
//! tokens in lockstep with recorder writes, so lineage in memory and
//! lineage in the audit trail can never diverge.
//!
//! Row data is **deep-copied** on fork and expand. Two live tokens must
//! never share mutable row substructure; shallow sharing has corrupted
//! nested-field lineage before and is treated as a defect, not an
//! optimization target. (`serde_json::Value::clone` clones the full tree.)
//!
//! The manager keeps no registry of live tokens: once a token is handed
//! off in a work item, memory ownership follows the work item.

use std::sync::Arc;

use serde_json::Value;

use elspeth_landscape::{
    ExpandGroupId, ForkGroupId, JoinGroupId, Landscape, RowId, TokenId, TokenRecord,
};

use crate::error::Result;

/// One row instance flowing along one DAG path.
#[derive(Debug, Clone)]
pub struct Token {
    pub token_id: TokenId,
    pub row_id: RowId,
    /// The row data this token currently carries. Owned by this token
    /// alone.
    pub data: Value,
    pub branch_name: Option<String>,
    pub fork_group_id: Option<ForkGroupId>,
    pub join_group_id: Option<JoinGroupId>,
    pub expand_group_id: Option<ExpandGroupId>,
}

impl Token {
    fn from_record(record: &TokenRecord, data: Value) -> Self {
        Self {
            token_id: record.token_id,
            row_id: record.row_id,
            data,
            branch_name: record.branch_name.clone(),
            fork_group_id: record.fork_group_id,
            join_group_id: record.join_group_id,
            expand_group_id: record.expand_group_id,
        }
    }
}

/// Creates seed, fork, expand, and join tokens against the recorder.
pub struct TokenManager {
    landscape: Arc<dyn Landscape>,
}

impl TokenManager {
    #[must_use]
    pub fn new(landscape: Arc<dyn Landscape>) -> Self {
        Self { landscape }
    }

    /// Seed token for a freshly created source row.
    pub async fn seed(&self, row_id: RowId, data: Value) -> Result<Token> {
        let record = self.landscape.create_token(row_id).await?;
        Ok(Token::from_record(&record, data))
    }

    /// One child per branch, each carrying a deep copy of the parent's
    /// row. Children share a fork group; the parent's outcome becomes
    /// `forked`.
    pub async fn fork(
        &self,
        parent: &Token,
        branches: &[String],
        step_in_pipeline: u32,
    ) -> Result<Vec<Token>> {
        let records = self
            .landscape
            .fork_tokens(parent.token_id, branches, Some(step_in_pipeline))
            .await?;
        Ok(records
            .iter()
            .map(|record| Token::from_record(record, parent.data.clone()))
            .collect())
    }

    /// One child per expanded row; children share an expand group and
    /// their ordinals follow row order.
    pub async fn expand(
        &self,
        parent: &Token,
        expanded_rows: Vec<Value>,
        step_in_pipeline: u32,
    ) -> Result<Vec<Token>> {
        let records = self
            .landscape
            .expand_token(
                parent.token_id,
                parent.row_id,
                expanded_rows.len() as u32,
                Some(step_in_pipeline),
            )
            .await?;
        Ok(records
            .iter()
            .zip(expanded_rows)
            .map(|(record, row)| Token::from_record(record, row))
            .collect())
    }

    /// One token from many: the coalesce output. Every input becomes a
    /// recorded parent.
    pub async fn join(
        &self,
        parents: &[Token],
        merged: Value,
        join_name: &str,
        step_in_pipeline: u32,
    ) -> Result<Token> {
        let parent_ids: Vec<TokenId> = parents.iter().map(|t| t.token_id).collect();
        let row_id = parents
            .first()
            .map(|t| t.row_id)
            .ok_or_else(|| crate::error::EngineError::Internal(
                "join requires at least one parent token".to_string(),
            ))?;
        let record = self
            .landscape
            .join_tokens(&parent_ids, row_id, join_name, Some(step_in_pipeline))
            .await?;
        Ok(Token::from_record(&record, merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_landscape::{
        canonical::CANONICAL_VERSION, Determinism, InMemoryLandscape, NodeId, NodeRegistration,
        NodeType,
    };
    use serde_json::json;

    async fn manager_with_row() -> (TokenManager, Arc<InMemoryLandscape>, RowId) {
        let landscape = Arc::new(InMemoryLandscape::new());
        let run = landscape
            .begin_run(&json!({}), CANONICAL_VERSION)
            .await
            .unwrap();
        let node = landscape
            .register_node(NodeRegistration {
                node_id: NodeId::generate(),
                run_id: run.run_id,
                plugin_name: "seed_source".to_string(),
                node_type: NodeType::Source,
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoRead,
                config: json!({}),
                input_schema: None,
                output_schema: Some(json!({})),
                sequence: Some(0),
            })
            .await
            .unwrap();
        let row = landscape
            .create_row(run.run_id, node.node_id, 0, &json!({"id": 1}))
            .await
            .unwrap();
        let manager = TokenManager::new(landscape.clone() as Arc<dyn Landscape>);
        (manager, landscape, row.row_id)
    }

    #[tokio::test]
    async fn test_fork_deep_copies_row_data() {
        let (manager, _landscape, row_id) = manager_with_row().await;
        let parent = manager
            .seed(row_id, json!({"nested": {"count": 1}}))
            .await
            .unwrap();
        let mut children = manager
            .fork(&parent, &["a".to_string(), "b".to_string()], 1)
            .await
            .unwrap();

        // Mutating one child's nested data must not leak anywhere.
        children[0].data["nested"]["count"] = json!(99);
        assert_eq!(children[1].data["nested"]["count"], json!(1));
        assert_eq!(parent.data["nested"]["count"], json!(1));
        assert_eq!(children[0].branch_name.as_deref(), Some("a"));
        assert_eq!(children[0].fork_group_id, children[1].fork_group_id);
    }

    #[tokio::test]
    async fn test_expand_assigns_rows_in_order() {
        let (manager, landscape, row_id) = manager_with_row().await;
        let parent = manager.seed(row_id, json!({"items": 3})).await.unwrap();
        let children = manager
            .expand(
                &parent,
                vec![json!({"i": 0}), json!({"i": 1}), json!({"i": 2})],
                2,
            )
            .await
            .unwrap();
        assert_eq!(children.len(), 3);
        for (i, child) in children.iter().enumerate() {
            assert_eq!(child.data["i"], json!(i));
            assert!(child.expand_group_id.is_some());
            let parents = landscape.token_parents(child.token_id).await.unwrap();
            assert_eq!(parents[0].ordinal, i as u32);
        }
    }

    #[tokio::test]
    async fn test_join_links_all_parents() {
        let (manager, landscape, row_id) = manager_with_row().await;
        let seed = manager.seed(row_id, json!({})).await.unwrap();
        let branches = manager
            .fork(&seed, &["x".to_string(), "y".to_string()], 1)
            .await
            .unwrap();
        let joined = manager
            .join(&branches, json!({"merged": true}), "rejoin", 3)
            .await
            .unwrap();
        assert_eq!(joined.data, json!({"merged": true}));
        assert!(joined.join_group_id.is_some());
        let parents = landscape.token_parents(joined.token_id).await.unwrap();
        assert_eq!(parents.len(), 2);
    }
}
