use std::collections::HashMap;

use pipeline_core::PredictionModel;

use crate::db::Store;
use crate::error::StoreResult;
use crate::params;
use crate::value::Row;

fn model_from_row(row: &Row) -> StoreResult<PredictionModel> {
    Ok(PredictionModel {
        model_id: row.text("model_id")?,
        display_name: row.opt_text("display_name").unwrap_or_default(),
        provider: row.text("provider")?,
        is_active: row.flag("is_active"),
        priority: row.opt_integer("priority").unwrap_or(0),
        config: row.json("config_json").unwrap_or(serde_json::Value::Null),
        capabilities: row
            .json("capabilities_json")
            .unwrap_or(serde_json::Value::Null),
        created_at: row.opt_text("created_at"),
    })
}

impl Store {
    /// Register a model. Existing rows are left untouched: apart from
    /// `is_active` and `priority` a model is immutable once registered.
    pub async fn register_model(&self, model: &PredictionModel) -> StoreResult<bool> {
        let result = self
            .execute(
                "INSERT INTO prediction_models
                    (model_id, display_name, provider, is_active, priority, config_json, capabilities_json, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(model_id) DO NOTHING",
                &params![
                    &model.model_id,
                    &model.display_name,
                    &model.provider,
                    model.is_active,
                    model.priority,
                    &model.config,
                    &model.capabilities,
                    model.created_at.clone().unwrap_or_else(|| self.now()),
                ],
            )
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn set_model_active(&self, model_id: &str, active: bool) -> StoreResult<()> {
        self.execute(
            "UPDATE prediction_models SET is_active = ? WHERE model_id = ?",
            &params![active, model_id],
        )
        .await?;
        Ok(())
    }

    pub async fn set_model_priority(&self, model_id: &str, priority: i64) -> StoreResult<()> {
        self.execute(
            "UPDATE prediction_models SET priority = ? WHERE model_id = ?",
            &params![priority, model_id],
        )
        .await?;
        Ok(())
    }

    /// Active models, highest priority first, ties in insertion order.
    pub async fn active_models(&self) -> StoreResult<Vec<PredictionModel>> {
        self.query(
            "SELECT * FROM prediction_models WHERE is_active = 1 ORDER BY priority DESC, rowid ASC",
            &[],
        )
        .await?
        .iter()
        .map(model_from_row)
        .collect()
    }

    pub async fn get_model(&self, model_id: &str) -> StoreResult<Option<PredictionModel>> {
        match self
            .query_row(
                "SELECT * FROM prediction_models WHERE model_id = ?",
                &params![model_id],
            )
            .await?
        {
            Some(row) => Ok(Some(model_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Priority of every registered model, active or not.
    pub async fn model_priorities(&self) -> StoreResult<HashMap<String, i64>> {
        let mut out = HashMap::new();
        for row in self
            .query("SELECT model_id, priority FROM prediction_models", &[])
            .await?
        {
            out.insert(row.text("model_id")?, row.opt_integer("priority").unwrap_or(0));
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn model(id: &str, priority: i64) -> PredictionModel {
        PredictionModel {
            model_id: id.to_string(),
            display_name: id.to_uppercase(),
            provider: "rule".to_string(),
            is_active: true,
            priority,
            config: json!({}),
            capabilities: json!({}),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn active_models_order_by_priority_then_insertion() {
        let store = Store::in_memory().await.unwrap();
        for m in [model("b", 50), model("a", 100), model("c", 50)] {
            assert!(store.register_model(&m).await.unwrap());
        }
        let ids: Vec<String> = store
            .active_models()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.model_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        store.set_model_active("a", false).await.unwrap();
        store.set_model_priority("c", 60).await.unwrap();
        let ids: Vec<String> = store
            .active_models()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.model_id)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(store.model_priorities().await.unwrap()["a"], 100);
    }

    #[tokio::test]
    async fn re_registration_does_not_mutate() {
        let store = Store::in_memory().await.unwrap();
        store.register_model(&model("a", 10)).await.unwrap();
        let mut changed = model("a", 99);
        changed.provider = "openai".into();
        assert!(!store.register_model(&changed).await.unwrap());
        let stored = store.get_model("a").await.unwrap().unwrap();
        assert_eq!(stored.priority, 10);
        assert_eq!(stored.provider, "rule");
    }
}
