use std::collections::{BTreeMap, HashMap};

use pipeline_core::{Signal, SignalState, User};

use crate::db::Store;
use crate::error::StoreResult;
use crate::params;
use crate::value::{placeholders, Row, Value};

fn user_from_row(row: &Row) -> StoreResult<User> {
    Ok(User {
        user_id: row.text("user_id")?,
        subscription_tier: row.opt_text("subscription_tier").unwrap_or_else(|| "free".into()),
        subscription_expires_at: row.opt_text("subscription_expires_at"),
        notification_settings: row.opt_text("notification_settings"),
    })
}

/// Web-push endpoint registered by a user's device.
#[derive(Debug, Clone, PartialEq)]
pub struct PushSubscription {
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: Option<String>,
    pub auth: Option<String>,
}

impl Store {
    pub async fn upsert_user(&self, user: &User) -> StoreResult<()> {
        self.execute(
            "INSERT INTO users (user_id, subscription_tier, subscription_expires_at, notification_settings, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                subscription_tier = excluded.subscription_tier,
                subscription_expires_at = excluded.subscription_expires_at,
                notification_settings = excluded.notification_settings",
            &params![
                &user.user_id,
                &user.subscription_tier,
                user.subscription_expires_at.as_deref(),
                user.notification_settings.as_deref(),
                self.now(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        match self
            .query_row("SELECT * FROM users WHERE user_id = ?", &params![user_id])
            .await?
        {
            Some(row) => Ok(Some(user_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_user(&self, user_id: &str) -> StoreResult<()> {
        self.execute("DELETE FROM users WHERE user_id = ?", &params![user_id])
            .await?;
        Ok(())
    }

    pub async fn add_to_watchlist(&self, user_id: &str, symbol: &str) -> StoreResult<()> {
        self.execute(
            "INSERT INTO user_watchlist (user_id, symbol, added_at) VALUES (?, ?, ?)
             ON CONFLICT(user_id, symbol) DO NOTHING",
            &params![user_id, symbol, self.now()],
        )
        .await?;
        Ok(())
    }

    pub async fn remove_from_watchlist(&self, user_id: &str, symbol: &str) -> StoreResult<()> {
        self.execute(
            "DELETE FROM user_watchlist WHERE user_id = ? AND symbol = ?",
            &params![user_id, symbol],
        )
        .await?;
        Ok(())
    }

    /// Distinct symbols across every watchlist.
    pub async fn watchlist_universe(&self) -> StoreResult<Vec<String>> {
        self.query("SELECT DISTINCT symbol FROM user_watchlist ORDER BY symbol", &[])
            .await?
            .iter()
            .map(|r| r.text("symbol"))
            .collect()
    }

    /// Users with a non-empty watchlist and their symbols in insertion order.
    pub async fn users_with_watchlists(&self) -> StoreResult<Vec<(User, Vec<String>)>> {
        let rows = self
            .query(
                "SELECT u.user_id, u.subscription_tier, u.subscription_expires_at,
                        u.notification_settings, w.symbol
                 FROM users u JOIN user_watchlist w ON w.user_id = u.user_id
                 ORDER BY u.user_id, w.rowid",
                &[],
            )
            .await?;
        let mut grouped: BTreeMap<String, (User, Vec<String>)> = BTreeMap::new();
        for row in &rows {
            let user = user_from_row(row)?;
            let symbol = row.text("symbol")?;
            grouped
                .entry(user.user_id.clone())
                .or_insert_with(|| (user, Vec::new()))
                .1
                .push(symbol);
        }
        Ok(grouped.into_values().collect())
    }

    /// `symbol -> [user_id]` for everyone watching any of `symbols`.
    pub async fn watchers_of(&self, symbols: &[String]) -> StoreResult<HashMap<String, Vec<String>>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT user_id, symbol FROM user_watchlist WHERE symbol IN ({}) ORDER BY user_id",
            placeholders(symbols.len())
        );
        let params: Vec<Value> = symbols.iter().map(Value::from).collect();
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for row in self.query(&sql, &params).await? {
            out.entry(row.text("symbol")?)
                .or_default()
                .push(row.text("user_id")?);
        }
        Ok(out)
    }

    pub async fn users_by_ids(&self, user_ids: &[String]) -> StoreResult<HashMap<String, User>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT * FROM users WHERE user_id IN ({})",
            placeholders(user_ids.len())
        );
        let params: Vec<Value> = user_ids.iter().map(Value::from).collect();
        let mut out = HashMap::new();
        for row in self.query(&sql, &params).await? {
            let user = user_from_row(&row)?;
            out.insert(user.user_id.clone(), user);
        }
        Ok(out)
    }

    pub async fn all_users(&self) -> StoreResult<Vec<User>> {
        self.query("SELECT * FROM users ORDER BY user_id", &[])
            .await?
            .iter()
            .map(user_from_row)
            .collect()
    }

    pub async fn add_push_subscription(&self, sub: &PushSubscription) -> StoreResult<()> {
        self.execute(
            "INSERT INTO push_subscriptions (user_id, endpoint, p256dh, auth, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, endpoint) DO UPDATE SET p256dh = excluded.p256dh, auth = excluded.auth",
            &params![
                &sub.user_id,
                &sub.endpoint,
                sub.p256dh.as_deref(),
                sub.auth.as_deref(),
                self.now(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn push_subscriptions(&self, user_id: &str) -> StoreResult<Vec<PushSubscription>> {
        self.query(
            "SELECT * FROM push_subscriptions WHERE user_id = ?",
            &params![user_id],
        )
        .await?
        .iter()
        .map(|r| {
            Ok(PushSubscription {
                user_id: r.text("user_id")?,
                endpoint: r.text("endpoint")?,
                p256dh: r.opt_text("p256dh"),
                auth: r.opt_text("auth"),
            })
        })
        .collect()
    }

    /// Prefetch signal states for the given users × symbols.
    pub async fn load_signal_states(
        &self,
        user_ids: &[String],
        symbols: &[String],
    ) -> StoreResult<Vec<SignalState>> {
        if user_ids.is_empty() || symbols.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM signal_states WHERE user_id IN ({}) AND symbol IN ({})",
            placeholders(user_ids.len()),
            placeholders(symbols.len())
        );
        let params: Vec<Value> = user_ids
            .iter()
            .chain(symbols.iter())
            .map(Value::from)
            .collect();
        let mut out = Vec::new();
        for row in self.query(&sql, &params).await? {
            let Some(last_signal) = Signal::parse(&row.text("last_signal")?) else {
                continue;
            };
            out.push(SignalState {
                user_id: row.text("user_id")?,
                symbol: row.text("symbol")?,
                last_signal,
                last_confidence: row.opt_real("last_confidence").unwrap_or(0.0),
                last_notified_at: row.opt_text("last_notified_at"),
            });
        }
        Ok(out)
    }

    /// Batch upsert; a `None` `last_notified_at` keeps the stored value.
    pub async fn upsert_signal_states(&self, states: &[SignalState]) -> StoreResult<u64> {
        let rows: Vec<Vec<Value>> = states
            .iter()
            .map(|s| {
                params![
                    &s.user_id,
                    &s.symbol,
                    s.last_signal.as_str(),
                    s.last_confidence,
                    s.last_notified_at.as_deref(),
                ]
            })
            .collect();
        self.insert_batch(
            "signal_states",
            &["user_id", "symbol", "last_signal", "last_confidence", "last_notified_at"],
            &rows,
            "ON CONFLICT(user_id, symbol) DO UPDATE SET
                last_signal = excluded.last_signal,
                last_confidence = excluded.last_confidence,
                last_notified_at = COALESCE(excluded.last_notified_at, signal_states.last_notified_at)",
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn user(id: &str, tier: &str) -> User {
        User {
            user_id: id.into(),
            subscription_tier: tier.into(),
            subscription_expires_at: None,
            notification_settings: None,
        }
    }

    #[tokio::test]
    async fn watchlists_group_per_user() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_user(&user("u1", "free")).await.unwrap();
        store.upsert_user(&user("u2", "pro")).await.unwrap();
        store.upsert_user(&user("u3", "free")).await.unwrap();
        store.add_to_watchlist("u1", "00700").await.unwrap();
        store.add_to_watchlist("u1", "AAPL").await.unwrap();
        store.add_to_watchlist("u2", "00700").await.unwrap();
        store.add_to_watchlist("u2", "00700").await.unwrap();

        let grouped = store.users_with_watchlists().await.unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].1, vec!["00700", "AAPL"]);
        assert_eq!(store.watchlist_universe().await.unwrap(), vec!["00700", "AAPL"]);

        let watchers = store.watchers_of(&["00700".into()]).await.unwrap();
        assert_eq!(watchers["00700"], vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn deleting_user_cascades() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_user(&user("u1", "free")).await.unwrap();
        store.add_to_watchlist("u1", "00700").await.unwrap();
        store
            .upsert_signal_states(&[SignalState {
                user_id: "u1".into(),
                symbol: "00700".into(),
                last_signal: Signal::Side,
                last_confidence: 0.5,
                last_notified_at: None,
            }])
            .await
            .unwrap();
        store.delete_user("u1").await.unwrap();
        assert!(store.watchlist_universe().await.unwrap().is_empty());
        assert!(store
            .load_signal_states(&["u1".into()], &["00700".into()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn signal_state_upsert_keeps_notified_at() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_user(&user("u1", "free")).await.unwrap();
        let mut state = SignalState {
            user_id: "u1".into(),
            symbol: "X".into(),
            last_signal: Signal::Side,
            last_confidence: 0.5,
            last_notified_at: Some("2026-01-01 09:00:00".into()),
        };
        store.upsert_signal_states(&[state.clone()]).await.unwrap();
        state.last_signal = Signal::Long;
        state.last_notified_at = None;
        store.upsert_signal_states(&[state]).await.unwrap();

        let loaded = store
            .load_signal_states(&["u1".into()], &["X".into()])
            .await
            .unwrap();
        assert_eq!(loaded[0].last_signal, Signal::Long);
        assert_eq!(loaded[0].last_notified_at.as_deref(), Some("2026-01-01 09:00:00"));
    }
}
