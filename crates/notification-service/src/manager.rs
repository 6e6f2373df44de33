//! Per-run notification session: signal-flip detection against cached
//! state, event queues per user, and one aggregated push per user on flush.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use pipeline_core::{PipelineResult, Signal, SignalState, User};
use sql_store::Store;

use crate::dispatcher::{Audience, DispatchOutcome, Dispatcher, Notification};
use crate::NotificationType;

/// Pre-market summary of one user's watchlist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MorningCall {
    pub bullish: Vec<String>,
    pub bearish: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum QueuedEvent {
    Flip {
        symbol: String,
        old: Signal,
        new: Signal,
        confidence: f64,
    },
    MorningCall(MorningCall),
    Glory {
        symbol: String,
        signal: Signal,
        change: f64,
    },
    PredictionUpdated {
        symbol: String,
        signal: Signal,
        confidence: f64,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub delivered: usize,
    pub suppressed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub states_written: u64,
}

type Key = (String, String);

pub struct NotificationManager {
    store: Store,
    dispatcher: Arc<Dispatcher>,
    date: String,
    signal_cache: HashMap<Key, SignalState>,
    pending_states: BTreeMap<Key, SignalState>,
    queued: BTreeMap<String, Vec<QueuedEvent>>,
}

impl NotificationManager {
    pub fn new(dispatcher: Arc<Dispatcher>, date: impl Into<String>) -> Self {
        Self {
            store: dispatcher.store().clone(),
            dispatcher,
            date: date.into(),
            signal_cache: HashMap::new(),
            pending_states: BTreeMap::new(),
            queued: BTreeMap::new(),
        }
    }

    pub async fn load_signal_states(&mut self, user_ids: &[String], symbols: &[String]) -> PipelineResult<usize> {
        let states = self.store.load_signal_states(user_ids, symbols).await?;
        let loaded = states.len();
        for state in states {
            self.signal_cache
                .insert((state.user_id.clone(), state.symbol.clone()), state);
        }
        tracing::debug!(loaded, "signal states cached");
        Ok(loaded)
    }

    /// Record the latest signal and queue a flip if it changed. A first
    /// sighting is recorded silently. Returns whether a flip was queued.
    pub fn check_signal_flip(&mut self, user_id: &str, symbol: &str, signal: Signal, confidence: f64) -> bool {
        let key = (user_id.to_string(), symbol.to_string());
        let previous = self.signal_cache.get(&key).map(|s| s.last_signal);

        let state = SignalState {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            last_signal: signal,
            last_confidence: confidence,
            last_notified_at: None,
        };
        self.signal_cache.insert(key.clone(), state.clone());
        self.pending_states.insert(key, state);

        match previous {
            Some(old) if old != signal => {
                tracing::info!(user_id, symbol, old = old.as_str(), new = signal.as_str(), "signal flip");
                self.queue(
                    user_id,
                    QueuedEvent::Flip {
                        symbol: symbol.to_string(),
                        old,
                        new: signal,
                        confidence,
                    },
                );
                true
            }
            _ => false,
        }
    }

    pub fn queue_morning_call(&mut self, user_id: &str, call: MorningCall) {
        self.queue(user_id, QueuedEvent::MorningCall(call));
    }

    pub fn queue_validation_glory(&mut self, user_id: &str, symbol: &str, signal: Signal, change: f64) {
        self.queue(
            user_id,
            QueuedEvent::Glory {
                symbol: symbol.to_string(),
                signal,
                change,
            },
        );
    }

    pub fn queue_prediction_updated(&mut self, user_id: &str, symbol: &str, signal: Signal, confidence: f64) {
        self.queue(
            user_id,
            QueuedEvent::PredictionUpdated {
                symbol: symbol.to_string(),
                signal,
                confidence,
            },
        );
    }

    fn queue(&mut self, user_id: &str, event: QueuedEvent) {
        self.queued.entry(user_id.to_string()).or_default().push(event);
    }

    pub fn queued_users(&self) -> usize {
        self.queued.len()
    }

    /// Send at most one notification per user, then write every pending
    /// state in one batch. Consumes the session.
    pub async fn flush(self) -> PipelineResult<FlushReport> {
        let Self {
            store,
            dispatcher,
            date,
            mut pending_states,
            queued,
            ..
        } = self;
        let mut report = FlushReport::default();

        let mut lookup_error = None;
        if !queued.is_empty() {
            match lookup(&store, &queued).await {
                Ok((users, names)) => {
                    for (user_id, events) in &queued {
                        let Some(user) = users.get(user_id) else {
                            tracing::warn!(user_id = %user_id, "queued notification for unknown user");
                            report.skipped += 1;
                            continue;
                        };
                        let Some(notification) = aggregate(events, &date, &names) else {
                            continue;
                        };
                        let flipped: Vec<String> = match notification.kind {
                            NotificationType::SignalFlip | NotificationType::SignalFlipBatch => {
                                notification.related_symbols.clone()
                            }
                            _ => Vec::new(),
                        };

                        match dispatcher.dispatch(&Audience::User(user.clone()), &notification).await {
                            outcome if outcome.delivered() => {
                                report.delivered += 1;
                                let now = store.now();
                                for symbol in flipped {
                                    if let Some(state) = pending_states.get_mut(&(user_id.clone(), symbol)) {
                                        state.last_notified_at = Some(now.clone());
                                    }
                                }
                            }
                            DispatchOutcome::Suppressed => report.suppressed += 1,
                            DispatchOutcome::Failed(_) => report.failed += 1,
                            _ => report.skipped += 1,
                        }
                    }
                }
                Err(e) => {
                    // Pending states are written regardless.
                    tracing::error!(users = queued.len(), "notification lookups failed: {}", e);
                    report.failed += queued.len();
                    lookup_error = Some(e);
                }
            }
        }

        if !pending_states.is_empty() {
            let states: Vec<SignalState> = pending_states.into_values().collect();
            report.states_written = store.upsert_signal_states(&states).await?;
        }

        tracing::info!(
            date = %date,
            delivered = report.delivered,
            suppressed = report.suppressed,
            failed = report.failed,
            states = report.states_written,
            "notification flush complete"
        );
        match lookup_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Recipients and display names for everything queued.
async fn lookup(
    store: &Store,
    queued: &BTreeMap<String, Vec<QueuedEvent>>,
) -> PipelineResult<(HashMap<String, User>, HashMap<String, String>)> {
    let user_ids: Vec<String> = queued.keys().cloned().collect();
    let users = store.users_by_ids(&user_ids).await?;
    let symbols: Vec<String> = queued
        .values()
        .flatten()
        .flat_map(|e| match e {
            QueuedEvent::Flip { symbol, .. }
            | QueuedEvent::Glory { symbol, .. }
            | QueuedEvent::PredictionUpdated { symbol, .. } => vec![symbol.clone()],
            QueuedEvent::MorningCall(call) => call.bullish.iter().chain(&call.bearish).cloned().collect(),
        })
        .collect();
    let names = store
        .stock_metas(&symbols)
        .await?
        .into_iter()
        .map(|(symbol, meta)| (symbol, meta.name))
        .collect();
    Ok((users, names))
}

fn name_of<'a>(names: &'a HashMap<String, String>, symbol: &'a str) -> &'a str {
    names.get(symbol).map(String::as_str).unwrap_or(symbol)
}

fn signed_pct(change: f64) -> String {
    format!("{:+.2}%", change)
}

fn pct(confidence: f64) -> String {
    format!("{:.0}%", confidence * 100.0)
}

/// Morning call, then validation glory, then flips, then plain updates.
fn aggregate(events: &[QueuedEvent], date: &str, names: &HashMap<String, String>) -> Option<Notification> {
    if let Some(call) = events.iter().find_map(|e| match e {
        QueuedEvent::MorningCall(call) => Some(call),
        _ => None,
    }) {
        let label = |symbols: &[String]| {
            symbols
                .iter()
                .take(2)
                .map(|s| name_of(names, s).to_string())
                .collect::<Vec<_>>()
                .join("、")
        };
        if call.bullish.is_empty() && call.bearish.is_empty() {
            return Some(
                Notification::new(NotificationType::MorningCallNeutral, date).var("count", call.total.to_string()),
            );
        }
        let top = if call.bullish.is_empty() { "暂无看多标的".to_string() } else { label(&call.bullish) };
        let risk = if call.bearish.is_empty() { "暂无".to_string() } else { label(&call.bearish) };
        return Some(
            Notification::new(NotificationType::MorningCall, date)
                .var("bullish_count", call.bullish.len().to_string())
                .var("bearish_count", call.bearish.len().to_string())
                .var("top", top)
                .var("risk", risk)
                .symbols(call.bullish.iter().chain(&call.bearish).cloned()),
        );
    }

    if let Some((symbol, signal, change)) = events.iter().find_map(|e| match e {
        QueuedEvent::Glory { symbol, signal, change } => Some((symbol, *signal, *change)),
        _ => None,
    }) {
        return Some(
            Notification::new(NotificationType::ValidationGlory, date)
                .var("symbol", symbol.clone())
                .var("name", name_of(names, symbol))
                .var("signal", signal.as_str())
                .var("signal_label", signal.label_zh())
                .var("change", signed_pct(change))
                .symbols([symbol.clone()]),
        );
    }

    let flips: Vec<(&String, Signal, Signal, f64)> = events
        .iter()
        .filter_map(|e| match e {
            QueuedEvent::Flip { symbol, old, new, confidence } => Some((symbol, *old, *new, *confidence)),
            _ => None,
        })
        .collect();
    match flips.as_slice() {
        [] => {}
        [(symbol, old, new, confidence)] => {
            return Some(
                Notification::new(NotificationType::SignalFlip, date)
                    .var("symbol", symbol.to_string())
                    .var("name", name_of(names, symbol))
                    .var("old", old.as_str())
                    .var("new", new.as_str())
                    .var("old_label", old.label_zh())
                    .var("new_label", new.label_zh())
                    .var("confidence", pct(*confidence))
                    .symbols([symbol.to_string()]),
            );
        }
        many => {
            let mut symbols: Vec<String> = many.iter().map(|(s, ..)| s.to_string()).collect();
            symbols.sort();
            symbols.dedup();
            let listed = symbols
                .iter()
                .map(|s| name_of(names, s).to_string())
                .collect::<Vec<_>>()
                .join("、");
            return Some(
                Notification::new(NotificationType::SignalFlipBatch, date)
                    .var("count", symbols.len().to_string())
                    .var("symbols", listed)
                    .symbols(symbols),
            );
        }
    }

    events.iter().find_map(|e| match e {
        QueuedEvent::PredictionUpdated { symbol, signal, confidence } => Some(
            Notification::new(NotificationType::PredictionUpdated, date)
                .var("symbol", symbol.clone())
                .var("name", name_of(names, symbol))
                .var("new_label", signal.label_zh())
                .var("confidence", pct(*confidence))
                .symbols([symbol.clone()]),
        ),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::user;
    use crate::RecordingTransport;
    use pipeline_core::{Market, MarketClock, StockMeta};
    use sql_store::{QueryResult, SqlBackend, SqlxBackend, StoreError, StoreResult, Value};

    async fn session(transport: Arc<RecordingTransport>) -> (Store, NotificationManager) {
        let store = Store::in_memory().await.unwrap();
        for id in ["U", "V"] {
            store.upsert_user(&user(id, "free", None)).await.unwrap();
        }
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), transport, "https://app.example.com"));
        (store.clone(), NotificationManager::new(dispatcher, "2026-01-02"))
    }

    fn state(user_id: &str, symbol: &str, signal: Signal) -> SignalState {
        SignalState {
            user_id: user_id.into(),
            symbol: symbol.into(),
            last_signal: signal,
            last_confidence: 0.6,
            last_notified_at: None,
        }
    }

    #[tokio::test]
    async fn single_flip_is_rendered_logged_and_recorded() {
        let transport = Arc::new(RecordingTransport::new());
        let (store, mut manager) = session(transport.clone()).await;
        store.upsert_signal_states(&[state("U", "S", Signal::Side)]).await.unwrap();

        manager.load_signal_states(&["U".into()], &["S".into()]).await.unwrap();
        assert!(manager.check_signal_flip("U", "S", Signal::Long, 0.9));
        let report = manager.flush().await.unwrap();
        assert_eq!(report.delivered, 1);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].title.contains('S'));
        assert!(sent[0].title.contains("[Side] → [Long]"));
        let logs = store.notification_logs_for("U").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].notification_type, "signal_flip");

        let states = store.load_signal_states(&["U".into()], &["S".into()]).await.unwrap();
        assert_eq!(states[0].last_signal, Signal::Long);
        assert!(states[0].last_notified_at.is_some());
    }

    #[tokio::test]
    async fn first_sighting_and_unchanged_signals_only_record() {
        let transport = Arc::new(RecordingTransport::new());
        let (store, mut manager) = session(transport.clone()).await;
        store.upsert_signal_states(&[state("U", "A", Signal::Long)]).await.unwrap();
        manager.load_signal_states(&["U".into()], &["A".into(), "B".into()]).await.unwrap();

        assert!(!manager.check_signal_flip("U", "A", Signal::Long, 0.8));
        assert!(!manager.check_signal_flip("U", "B", Signal::Short, 0.8));
        let report = manager.flush().await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.states_written, 2);
        assert!(transport.sent().is_empty());
        assert_eq!(store.count_all_notifications().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn several_flips_batch_and_morning_call_wins() {
        let transport = Arc::new(RecordingTransport::new());
        let (store, mut manager) = session(transport.clone()).await;
        store
            .upsert_stock_meta(&StockMeta {
                symbol: "00700".into(),
                name: "腾讯控股".into(),
                market: Market::HK,
                last_updated: None,
                industry: None,
                main_business: None,
                description: None,
            })
            .await
            .unwrap();
        store
            .upsert_signal_states(&[
                state("U", "00700", Signal::Side),
                state("U", "09988", Signal::Long),
                state("V", "00700", Signal::Side),
            ])
            .await
            .unwrap();
        let users = vec!["U".to_string(), "V".to_string()];
        manager
            .load_signal_states(&users, &["00700".into(), "09988".into()])
            .await
            .unwrap();

        manager.check_signal_flip("U", "00700", Signal::Long, 0.9);
        manager.check_signal_flip("U", "09988", Signal::Short, 0.8);
        manager.check_signal_flip("V", "00700", Signal::Long, 0.9);
        manager.queue_validation_glory("V", "00700", Signal::Long, 2.1);
        manager.queue_morning_call(
            "V",
            MorningCall {
                bullish: vec!["00700".into()],
                bearish: Vec::new(),
                total: 1,
            },
        );

        let report = manager.flush().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(store.count_notifications("U", "signal_flip_batch").await.unwrap(), 1);
        assert_eq!(store.count_notifications("V", "morning_call").await.unwrap(), 1);
        assert_eq!(store.count_all_notifications().await.unwrap(), 2);
        let batch = transport.sent().into_iter().find(|p| p.target_user_id.as_deref() == Some("U")).unwrap();
        assert_eq!(batch.title, "2 只自选股信号更新");
        assert!(batch.body.contains("腾讯控股"));
    }

    #[test]
    fn glory_beats_flips() {
        let events = vec![
            QueuedEvent::Flip {
                symbol: "A".into(),
                old: Signal::Side,
                new: Signal::Long,
                confidence: 0.8,
            },
            QueuedEvent::Glory {
                symbol: "B".into(),
                signal: Signal::Short,
                change: -3.0,
            },
        ];
        let n = aggregate(&events, "2026-01-02", &HashMap::new()).unwrap();
        assert_eq!(n.kind, NotificationType::ValidationGlory);
        assert!(n.vars.contains(&("change", "-3.00%".to_string())));
    }

    /// Fails the recipient lookup and passes every other statement through.
    struct BrokenUserLookup {
        inner: Arc<SqlxBackend>,
    }

    #[async_trait::async_trait]
    impl SqlBackend for BrokenUserLookup {
        async fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<QueryResult> {
            if sql.contains("FROM users WHERE user_id IN") {
                return Err(StoreError::Fatal("users table unreadable".into()));
            }
            self.inner.execute(sql, params).await
        }

        async fn execute_many(&self, sql: &str, batches: &[Vec<Value>]) -> StoreResult<u64> {
            self.inner.execute_many(sql, batches).await
        }

        async fn close(&self) {}

        fn name(&self) -> &'static str {
            "broken-user-lookup"
        }
    }

    #[tokio::test]
    async fn failed_lookup_still_persists_states() {
        let inner = Arc::new(SqlxBackend::connect("sqlite::memory:", 1).await.unwrap());
        let healthy = Store::new(inner.clone(), MarketClock::default());
        healthy.init_schema().await.unwrap();
        healthy.upsert_user(&user("U", "free", None)).await.unwrap();
        healthy.upsert_signal_states(&[state("U", "S", Signal::Side)]).await.unwrap();

        let broken = Store::new(Arc::new(BrokenUserLookup { inner }), MarketClock::default());
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Arc::new(Dispatcher::new(broken, transport.clone(), "https://app.example.com"));
        let mut manager = NotificationManager::new(dispatcher, "2026-01-02");
        manager
            .load_signal_states(&["U".into()], &["S".into(), "T".into()])
            .await
            .unwrap();
        assert!(manager.check_signal_flip("U", "S", Signal::Long, 0.9));
        assert!(!manager.check_signal_flip("U", "T", Signal::Short, 0.8));

        assert!(manager.flush().await.is_err());
        assert!(transport.sent().is_empty());

        let mut states = healthy
            .load_signal_states(&["U".into()], &["S".into(), "T".into()])
            .await
            .unwrap();
        states.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].last_signal, Signal::Long);
        assert!(states[0].last_notified_at.is_none());
        assert_eq!(states[1].last_signal, Signal::Short);
    }

    #[tokio::test]
    async fn empty_flush_is_a_noop() {
        let transport = Arc::new(RecordingTransport::new());
        let (store, manager) = session(transport.clone()).await;
        assert_eq!(manager.flush().await.unwrap(), FlushReport::default());
        assert_eq!(store.count_all_notifications().await.unwrap(), 0);
        assert!(store.load_signal_states(&["U".into()], &["S".into()]).await.unwrap().is_empty());
    }
}
