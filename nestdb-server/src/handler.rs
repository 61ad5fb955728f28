//! Command handlers.

use crate::auth::SecretValidator;
use crate::broadcast::EventHub;
use crate::connection::ConnectionRegistry;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::script::{panic_message, ScriptRunner};
use nestdb_core::{ConnectionId, Database, EventRegistry, KeyPath, Script};
use nestdb_protocol::message::*;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Command handler.
///
/// Every routed command locks the database once, so commands and scripts
/// never interleave.
pub struct CommandHandler {
    db: Arc<Mutex<Database>>,
    connections: ConnectionRegistry,
    hub: EventHub,
    validator: SecretValidator,
    /// Whether `isWatching` responses carry the subscription flag.
    report_is_watching: bool,
    metrics: Option<Arc<Metrics>>,
}

impl CommandHandler {
    /// Creates a handler over `db` with authentication disabled.
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self {
            db,
            connections: ConnectionRegistry::new(),
            hub: EventHub::new(),
            validator: SecretValidator::disabled(),
            report_is_watching: false,
            metrics: None,
        }
    }

    /// Requires `init` with a secret accepted by `validator`.
    pub fn with_validator(mut self, validator: SecretValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_report_is_watching(mut self, report: bool) -> Self {
        self.report_is_watching = report;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn database(&self) -> &Arc<Mutex<Database>> {
        &self.db
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Registers a new connection and its outbound event queue.
    pub fn on_connect(&self, conn: ConnectionId, outbound: mpsc::Sender<EventNotification>) {
        self.connections.on_connect(conn);
        self.hub.register(conn, outbound);
    }

    /// Tears a connection down: runs its death query, forgets it and drops
    /// its subscriptions.
    pub fn on_disconnect(&self, conn: ConnectionId) {
        let mut db = self.db.lock();
        let record = self.connections.remove(conn);
        if let Some(query) = record.and_then(|r| r.death_query) {
            ScriptRunner::run_death_query(&mut db, conn, &query);
        }
        let purged = db.events.purge(conn);
        self.record_subscriptions(&db.events);
        drop(db);

        self.hub.unregister(conn);
        if purged > 0 {
            tracing::debug!("Dropped {} subscription(s) of connection {}", purged, conn);
        }
    }

    /// Returns whether a command from `conn` must wait for `init`.
    fn requires_auth(&self, conn: ConnectionId, action: Option<Action>) -> bool {
        self.validator.is_enabled()
            && action != Some(Action::Init)
            && !self.connections.is_active(conn)
    }

    /// Handles a request and returns the response to write, if any.
    pub fn handle(&self, conn: ConnectionId, request: &Request) -> Option<Response> {
        let action = request.parsed_action();
        let label = action.map(|a| a.as_str()).unwrap_or("unknown");

        let timer = self.metrics.as_ref().map(|m| {
            m.command_duration
                .with_label_values(&[label])
                .start_timer()
        });

        if self.requires_auth(conn, action) {
            if let Some(ref metrics) = self.metrics {
                metrics.commands_total.with_label_values(&[label]).inc();
                metrics
                    .errors_total
                    .with_label_values(&[ServerError::NotAuthenticated.kind()])
                    .inc();
            }
            tracing::debug!(
                "Connection {} sent '{}' before init",
                conn,
                request.action
            );
            drop(timer);
            return Some(
                Response::to(request).with_error(ServerError::NotAuthenticated.response_message()),
            );
        }

        let Some(action) = action else {
            tracing::debug!(
                "Ignoring unknown action '{}' from connection {}",
                request.action,
                conn
            );
            return None;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.route(conn, action, request)))
            .unwrap_or_else(|payload| {
                Err(ServerError::HandlerPanic(panic_message(payload.as_ref())))
            });

        if let Some(ref metrics) = self.metrics {
            metrics.commands_total.with_label_values(&[label]).inc();
            if let Err(ref e) = result {
                metrics.errors_total.with_label_values(&[e.kind()]).inc();
            }
        }
        drop(timer);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, ServerError::HandlerPanic(_)) {
                    tracing::error!("Connection {} {}: {}", conn, action, e);
                } else {
                    tracing::debug!("Connection {} {} failed: {}", conn, action, e);
                }
                Response::to(request).with_error(e.response_message())
            }
        };

        if action.honors_no_ack() && request.no_ack() {
            return None;
        }
        Some(response)
    }

    fn route(
        &self,
        conn: ConnectionId,
        action: Action,
        request: &Request,
    ) -> Result<Response, ServerError> {
        let response = Response::to(request);
        match action {
            Action::Init => self.handle_init(conn, request, response),
            Action::Set => self.handle_set(request, response),
            Action::Get => self.handle_get(request, response),
            Action::GetRange => self.handle_get_range(request, response),
            Action::GetAll => self.handle_get_all(response),
            Action::Count => self.handle_count(request, response),
            Action::Add => self.handle_add(request, response),
            Action::Concat => self.handle_concat(request, response),
            Action::Remove => self.handle_remove(request, response),
            Action::RemoveRange => self.handle_remove_range(request, response),
            Action::RemoveAll => self.handle_remove_all(response),
            Action::Pop => self.handle_pop(request, response),
            Action::HasKey => self.handle_has_key(request, response),
            Action::Expire => self.handle_expire(request, response),
            Action::Unexpire => self.handle_unexpire(request, response),
            Action::GetExpiry => self.handle_get_expiry(request, response),
            Action::RegisterDeathQuery => self.handle_register_death_query(conn, request, response),
            Action::Run => self.handle_run(request, response),
            Action::Watch => self.handle_watch(conn, request, response),
            Action::WatchExclusive => self.handle_watch_exclusive(conn, request, response),
            Action::Unwatch => self.handle_unwatch(conn, request, response),
            Action::IsWatching => self.handle_is_watching(conn, request, response),
            Action::Broadcast => self.handle_broadcast(request, response),
        }
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    fn handle_init(
        &self,
        conn: ConnectionId,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: InitParams = parse_params(request)?;
        if !self
            .connections
            .authenticate(conn, params.secret_key.as_deref(), &self.validator)
        {
            tracing::warn!("Connection {} supplied an invalid secret", conn);
            return Err(ServerError::AuthFailed);
        }
        tracing::debug!("Connection {} initialized", conn);
        Ok(response)
    }

    // =========================================================================
    // Store
    // =========================================================================

    fn handle_set(&self, request: &Request, response: Response) -> Result<Response, ServerError> {
        let params: WriteParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let stored = self.db.lock().store.set(&key, params.value)?;
        Ok(if params.get_value {
            response.with_value(stored)
        } else {
            response
        })
    }

    fn handle_get(&self, request: &Request, response: Response) -> Result<Response, ServerError> {
        let params: KeyParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let value = self.db.lock().store.get(&key);
        Ok(response.with_optional_value(value))
    }

    fn handle_get_range(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: RangeParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let value = self.db.lock().store.get_range(
            &key,
            params.from_index.unwrap_or(0),
            params.to_index,
        )?;
        Ok(response.with_optional_value(value))
    }

    fn handle_get_all(&self, response: Response) -> Result<Response, ServerError> {
        let all = self.db.lock().store.get_all();
        Ok(response.with_value(all))
    }

    fn handle_count(&self, request: &Request, response: Response) -> Result<Response, ServerError> {
        let params: KeyParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let count = self.db.lock().store.count(&key);
        Ok(response.with_value(Value::from(count)))
    }

    fn handle_add(&self, request: &Request, response: Response) -> Result<Response, ServerError> {
        let params: WriteParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let total = self.db.lock().store.add(&key, &params.value)?;
        Ok(if params.get_value {
            response.with_value(total)
        } else {
            response
        })
    }

    fn handle_concat(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: WriteParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let joined = self.db.lock().store.concat(&key, params.value)?;
        Ok(if params.get_value {
            response.with_value(joined)
        } else {
            response
        })
    }

    fn handle_remove(&self, request: &Request, response: Response) -> Result<Response, ServerError> {
        let params: RemoveParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let removed = self.db.lock().store.remove(&key)?;
        Ok(if params.get_value {
            response.with_optional_value(removed)
        } else {
            response
        })
    }

    fn handle_remove_range(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: RangeParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let removed = self.db.lock().store.remove_range(
            &key,
            params.from_index.unwrap_or(0),
            params.to_index,
        )?;
        Ok(if params.get_value {
            response.with_optional_value(removed)
        } else {
            response
        })
    }

    fn handle_remove_all(&self, response: Response) -> Result<Response, ServerError> {
        self.db.lock().store.remove_all();
        Ok(response)
    }

    fn handle_pop(&self, request: &Request, response: Response) -> Result<Response, ServerError> {
        let params: RemoveParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let popped = self.db.lock().store.pop(&key)?;
        Ok(if params.get_value {
            response.with_optional_value(popped)
        } else {
            response
        })
    }

    fn handle_has_key(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: KeyParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let present = self.db.lock().store.has_key(&key);
        Ok(response.with_value(Value::Bool(present)))
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    fn handle_expire(&self, request: &Request, response: Response) -> Result<Response, ServerError> {
        let params: ExpireParams = parse_params(request)?;
        let keys = KeyPath::from_values(&params.keys)?;
        self.db.lock().expiry.expire(&keys, params.value)?;
        Ok(response)
    }

    fn handle_unexpire(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: KeysParams = parse_params(request)?;
        let keys = KeyPath::from_values(&params.keys)?;
        self.db.lock().expiry.unexpire(&keys);
        Ok(response)
    }

    fn handle_get_expiry(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: KeyParams = parse_params(request)?;
        let key = KeyPath::from_value(&params.key)?;
        let deadline = self.db.lock().expiry.get_expiry(&key);
        Ok(response.with_optional_value(deadline.map(Value::from)))
    }

    // =========================================================================
    // Scripts
    // =========================================================================

    fn handle_register_death_query(
        &self,
        conn: ConnectionId,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: DeathQueryParams = parse_params(request)?;
        Script::parse(&params.value)?;
        if !self.connections.set_death_query(conn, params.value) {
            tracing::debug!("Death query for unknown connection {} ignored", conn);
        }
        Ok(response)
    }

    fn handle_run(&self, request: &Request, response: Response) -> Result<Response, ServerError> {
        let params: RunParams = parse_params(request)?;
        let base = params
            .base_key
            .as_ref()
            .filter(|key| !key.is_null())
            .map(KeyPath::from_value)
            .transpose()?;
        let mut db = self.db.lock();
        let value =
            ScriptRunner::run(&mut db, &params.value, base).map_err(ServerError::Script)?;
        self.record_subscriptions(&db.events);
        Ok(response.with_optional_value(value))
    }

    // =========================================================================
    // Events
    // =========================================================================

    fn handle_watch(
        &self,
        conn: ConnectionId,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: WatchParams = parse_params(request)?;
        let path = KeyPath::from_value(&params.event)?;
        let mut db = self.db.lock();
        db.events.subscribe(conn, path);
        self.record_subscriptions(&db.events);
        Ok(response.with_event(Some(params.event)))
    }

    fn handle_watch_exclusive(
        &self,
        conn: ConnectionId,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: WatchParams = parse_params(request)?;
        let path = KeyPath::from_value(&params.event)?;
        let mut db = self.db.lock();
        let listening = db.events.any_subscribed(&path);
        if !listening {
            db.events.subscribe(conn, path);
            self.record_subscriptions(&db.events);
        }
        Ok(response
            .with_event(Some(params.event))
            .with_value(Value::Bool(listening)))
    }

    fn handle_unwatch(
        &self,
        conn: ConnectionId,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: UnwatchParams = parse_params(request)?;
        let path = params
            .event
            .as_ref()
            .map(KeyPath::from_value)
            .transpose()?;
        let mut db = self.db.lock();
        db.events.unsubscribe(conn, path.as_ref());
        self.record_subscriptions(&db.events);
        Ok(response.with_event(params.event))
    }

    fn handle_is_watching(
        &self,
        conn: ConnectionId,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: WatchParams = parse_params(request)?;
        let path = KeyPath::from_value(&params.event)?;
        let watching = self.db.lock().events.is_subscribed(conn, &path);
        let response = response.with_event(Some(params.event));
        Ok(if self.report_is_watching {
            response.with_value(Value::Bool(watching))
        } else {
            response
        })
    }

    fn handle_broadcast(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<Response, ServerError> {
        let params: BroadcastParams = parse_params(request)?;
        let path = KeyPath::from_value(&params.event)?;
        let targets = self.db.lock().events.subscribers_of(&path);

        let note = EventNotification::new(params.event.clone(), params.value.clone());
        let report = self.hub.deliver(&targets, &note);
        if let Some(ref metrics) = self.metrics {
            metrics.events_delivered_total.inc_by(report.delivered as f64);
            metrics.events_dropped_total.inc_by(report.dropped as f64);
        }
        tracing::trace!(
            "Broadcast on '{}' reached {} of {} subscriber(s)",
            path,
            report.delivered,
            targets.len()
        );

        Ok(response
            .with_optional_value(params.value)
            .with_event(Some(params.event)))
    }

    fn record_subscriptions(&self, events: &EventRegistry) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .subscriptions_active
                .set(events.subscription_count() as f64);
        }
    }
}

/// Deserializes the action-specific fields of `request`.
fn parse_params<T: DeserializeOwned>(request: &Request) -> Result<T, ServerError> {
    serde_json::from_value(request.params_value())
        .map_err(|e| ServerError::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_handler() -> CommandHandler {
        let handler = CommandHandler::new(Arc::new(Mutex::new(Database::new())));
        connect(&handler, 2);
        handler
    }

    fn test_handler_with_secret(secret: &str) -> CommandHandler {
        let handler = CommandHandler::new(Arc::new(Mutex::new(Database::new())))
            .with_validator(SecretValidator::new(Some(secret)));
        connect(&handler, 2);
        handler
    }

    fn connect(handler: &CommandHandler, conn: ConnectionId) -> mpsc::Receiver<EventNotification> {
        let (tx, rx) = mpsc::channel(16);
        handler.on_connect(conn, tx);
        rx
    }

    fn request(id: u64, action: Action, params: Value) -> Request {
        let mut request = Request::new(id, action);
        if let Value::Object(map) = params {
            request.params = map;
        }
        request
    }

    fn send(handler: &CommandHandler, conn: ConnectionId, action: Action, params: Value) -> Response {
        handler
            .handle(conn, &request(1, action, params))
            .expect("expected a response")
    }

    #[test]
    fn test_set_and_get() {
        let handler = test_handler();

        let response = send(&handler, 2, Action::Set, json!({"key": "a.b", "value": 5}));
        assert!(response.is_ok());
        assert_eq!(response.value, None);
        assert_eq!(response.action, "set");
        assert_eq!(response.msg_type, "response");

        let response = send(&handler, 2, Action::Get, json!({"key": "a"}));
        assert_eq!(response.value, Some(json!({"b": 5})));

        let response = send(&handler, 2, Action::Get, json!({"key": ["a", "b"]}));
        assert_eq!(response.value, Some(json!(5)));
    }

    #[test]
    fn test_get_missing_omits_value() {
        let handler = test_handler();
        let response = send(&handler, 2, Action::Get, json!({"key": "nope"}));
        assert!(response.is_ok());
        assert_eq!(response.value, None);
    }

    #[test]
    fn test_get_value_flag() {
        let handler = test_handler();

        let response = send(
            &handler,
            2,
            Action::Set,
            json!({"key": "n", "value": 1, "getValue": true}),
        );
        assert_eq!(response.value, Some(json!(1)));

        let response = send(
            &handler,
            2,
            Action::Add,
            json!({"key": "n", "value": 4, "getValue": true}),
        );
        assert_eq!(response.value, Some(json!(5)));

        let response = send(&handler, 2, Action::Add, json!({"key": "n", "value": 1}));
        assert_eq!(response.value, None);

        let response = send(
            &handler,
            2,
            Action::Concat,
            json!({"key": "list", "value": [1, 2], "getValue": true}),
        );
        assert_eq!(response.value, Some(json!([1, 2])));
    }

    #[test]
    fn test_ranges_count_and_pop() {
        let handler = test_handler();
        send(&handler, 2, Action::Set, json!({"key": "xs", "value": [1, 2, 3, 4, 5]}));

        let response = send(
            &handler,
            2,
            Action::GetRange,
            json!({"key": "xs", "fromIndex": 1, "toIndex": 3}),
        );
        assert_eq!(response.value, Some(json!([2, 3])));

        let response = send(&handler, 2, Action::Count, json!({"key": "xs"}));
        assert_eq!(response.value, Some(json!(5)));

        let response = send(
            &handler,
            2,
            Action::RemoveRange,
            json!({"key": "xs", "fromIndex": 3, "getValue": true}),
        );
        assert_eq!(response.value, Some(json!([4, 5])));

        let response = send(&handler, 2, Action::Pop, json!({"key": "xs", "getValue": true}));
        assert_eq!(response.value, Some(json!(3)));

        let response = send(&handler, 2, Action::GetAll, json!({}));
        assert_eq!(response.value, Some(json!({"xs": [1, 2]})));
    }

    #[test]
    fn test_remove_and_has_key() {
        let handler = test_handler();
        send(&handler, 2, Action::Set, json!({"key": "a.b", "value": 1}));

        let response = send(&handler, 2, Action::HasKey, json!({"key": "a.b"}));
        assert_eq!(response.value, Some(json!(true)));

        let response = send(&handler, 2, Action::Remove, json!({"key": "a", "getValue": true}));
        assert_eq!(response.value, Some(json!({"b": 1})));

        let response = send(&handler, 2, Action::HasKey, json!({"key": "a.b"}));
        assert_eq!(response.value, Some(json!(false)));

        send(&handler, 2, Action::Set, json!({"key": "x", "value": 1}));
        let response = send(&handler, 2, Action::RemoveAll, json!({}));
        assert!(response.is_ok());
        let response = send(&handler, 2, Action::GetAll, json!({}));
        assert_eq!(response.value, Some(json!({})));
    }

    #[test]
    fn test_store_errors_are_prefixed() {
        let handler = test_handler();
        send(&handler, 2, Action::Set, json!({"key": "s", "value": "text"}));

        let response = send(&handler, 2, Action::Add, json!({"key": "s", "value": 1}));
        let error = response.error.unwrap();
        assert!(error.starts_with("failed to process command: "));
        assert!(error.contains("not a number"));

        let response = send(&handler, 2, Action::Set, json!({"value": 1}));
        assert!(response
            .error
            .unwrap()
            .starts_with("failed to process command: invalid request"));
    }

    #[test]
    fn test_auth_gate() {
        let handler = test_handler_with_secret("pw");

        let response = send(&handler, 2, Action::Get, json!({"key": "a"}));
        assert_eq!(
            response.error.as_deref(),
            Some("cannot process command before init handshake")
        );

        let response = send(&handler, 2, Action::Init, json!({"secretKey": "wrong"}));
        assert_eq!(
            response.error.as_deref(),
            Some("invalid secret supplied to init")
        );
        assert_eq!(response.action, "init");

        let response = send(&handler, 2, Action::Get, json!({"key": "a"}));
        assert!(response.is_error());

        let response = send(&handler, 2, Action::Init, json!({"secretKey": "pw"}));
        assert!(response.is_ok());

        let response = send(&handler, 2, Action::Get, json!({"key": "a"}));
        assert!(response.is_ok());
    }

    #[test]
    fn test_auth_gate_blocks_writes() {
        let handler = test_handler_with_secret("pw");
        let gated = [
            request(1, Action::Set, json!({"key": "a", "value": 1})),
            request(2, Action::Concat, json!({"key": "xs", "value": [1]})),
            request(3, Action::Run, json!({"value": "store.set('b', 2)"})),
            request(4, Action::Expire, json!({"keys": ["a"], "value": 60_000})),
        ];

        for request in &gated {
            let response = handler.handle(2, request).unwrap();
            assert_eq!(
                response.error.as_deref(),
                Some("cannot process command before init handshake")
            );
        }

        let db = handler.database().lock();
        assert_eq!(db.store.get_all(), json!({}));
        assert!(db.expiry.is_empty());
    }

    #[test]
    fn test_auth_gate_applies_to_unknown_actions() {
        let handler = test_handler_with_secret("pw");
        let mut unknown = Request::new(7, Action::Get);
        unknown.action = "flushAll".to_string();

        let response = handler.handle(2, &unknown).unwrap();
        assert_eq!(response.action, "flushAll");
        assert_eq!(response.id, Some(json!(7)));
        assert!(response.is_error());

        send(&handler, 2, Action::Init, json!({"secretKey": "pw"}));
        assert!(handler.handle(2, &unknown).is_none());
    }

    #[test]
    fn test_init_without_secret_configured() {
        let handler = test_handler();
        let response = send(&handler, 2, Action::Init, json!({}));
        assert!(response.is_ok());
        assert!(handler.connections().is_active(2));
    }

    #[test]
    fn test_unknown_action_ignored() {
        let handler = test_handler();
        let mut request = Request::new(1, Action::Get);
        request.action = "explode".to_string();
        assert!(handler.handle(2, &request).is_none());
    }

    #[test]
    fn test_no_ack() {
        let handler = test_handler();
        send(&handler, 2, Action::Set, json!({"key": "xs", "value": [1, 2]}));

        let pop = request(3, Action::Pop, json!({"key": "xs", "noAck": true}));
        assert!(handler.handle(2, &pop).is_none());

        let failing = request(4, Action::Run, json!({"value": "1 / 0", "noAck": true}));
        assert!(handler.handle(2, &failing).is_none());

        // Not honored by other actions.
        let set = request(5, Action::Set, json!({"key": "a", "value": 1, "noAck": true}));
        assert!(handler.handle(2, &set).is_some());

        let response = send(&handler, 2, Action::Get, json!({"key": "xs"}));
        assert_eq!(response.value, Some(json!([1])));
    }

    #[test]
    fn test_expiry_commands() {
        let handler = test_handler();
        send(&handler, 2, Action::Set, json!({"key": "temp", "value": 1}));

        let response = send(&handler, 2, Action::Expire, json!({"keys": ["temp"], "value": 60_000}));
        assert!(response.is_ok());
        assert_eq!(response.value, None);

        let response = send(&handler, 2, Action::GetExpiry, json!({"key": "temp"}));
        let deadline = response.value.unwrap().as_i64().unwrap();
        assert!(deadline > nestdb_core::now_millis());

        send(&handler, 2, Action::Unexpire, json!({"keys": ["temp"]}));
        let response = send(&handler, 2, Action::GetExpiry, json!({"key": "temp"}));
        assert_eq!(response.value, None);
    }

    #[test]
    fn test_run_script() {
        let handler = test_handler();
        send(&handler, 2, Action::Set, json!({"key": "users.7.score", "value": 10}));

        let response = send(
            &handler,
            2,
            Action::Run,
            json!({"value": "store.add('score', 5)", "baseKey": "users.7"}),
        );
        assert_eq!(response.value, Some(json!(15)));

        let response = send(&handler, 2, Action::Run, json!({"value": "let x = 1;"}));
        assert!(response.is_ok());
        assert_eq!(response.value, None);

        let response = send(&handler, 2, Action::Run, json!({"value": "store.get("}));
        assert!(response
            .error
            .unwrap()
            .starts_with("exception at run(): "));
    }

    #[test]
    fn test_register_death_query_rejects_bad_script() {
        let handler = test_handler();
        let response = send(
            &handler,
            2,
            Action::RegisterDeathQuery,
            json!({"value": "store.set("}),
        );
        assert!(response
            .error
            .unwrap()
            .starts_with("failed to process command: "));
    }

    #[test]
    fn test_death_query_runs_on_disconnect() {
        let handler = test_handler();
        send(&handler, 2, Action::Set, json!({"key": "online.2", "value": true}));
        send(&handler, 2, Action::Watch, json!({"event": "room"}));

        let response = send(
            &handler,
            2,
            Action::RegisterDeathQuery,
            json!({"value": "store.remove('online.2');"}),
        );
        assert!(response.is_ok());

        handler.on_disconnect(2);

        let db = handler.database().lock();
        assert!(!db.store.has_key(&KeyPath::parse("online.2")));
        assert!(!db.events.any_subscribed(&KeyPath::parse("room")));
        drop(db);
        assert!(!handler.connections().contains(2));
        assert!(!handler.hub().is_registered(2));
    }

    #[test]
    fn test_watch_and_is_watching() {
        let handler = test_handler();

        let response = send(&handler, 2, Action::Watch, json!({"event": ["chat", "room1"]}));
        assert_eq!(response.event, Some(json!(["chat", "room1"])));
        assert_eq!(response.value, None);

        let response = send(&handler, 2, Action::IsWatching, json!({"event": "chat.room1"}));
        assert_eq!(response.event, Some(json!("chat.room1")));
        assert_eq!(response.value, None);

        let reporting = CommandHandler::new(Arc::new(Mutex::new(Database::new())))
            .with_report_is_watching(true);
        connect(&reporting, 3);
        send(&reporting, 3, Action::Watch, json!({"event": "chat"}));
        let response = send(&reporting, 3, Action::IsWatching, json!({"event": "chat"}));
        assert_eq!(response.value, Some(json!(true)));
        let response = send(&reporting, 3, Action::IsWatching, json!({"event": "chat.x"}));
        assert_eq!(response.value, Some(json!(false)));
    }

    #[test]
    fn test_unwatch() {
        let handler = test_handler();
        send(&handler, 2, Action::Watch, json!({"event": "a"}));
        send(&handler, 2, Action::Watch, json!({"event": "b"}));

        let response = send(&handler, 2, Action::Unwatch, json!({"event": "a"}));
        assert_eq!(response.event, Some(json!("a")));
        {
            let db = handler.database().lock();
            assert_eq!(db.events.subscriptions_of(2), vec![KeyPath::parse("b")]);
        }

        let response = send(&handler, 2, Action::Unwatch, json!({}));
        assert_eq!(response.event, None);
        assert!(handler.database().lock().events.subscriptions_of(2).is_empty());
    }

    #[test]
    fn test_watch_exclusive() {
        let handler = test_handler();
        let _rx = connect(&handler, 3);

        let response = send(&handler, 2, Action::WatchExclusive, json!({"event": "leader"}));
        assert_eq!(response.value, Some(json!(false)));
        assert_eq!(response.event, Some(json!("leader")));

        let response = send(&handler, 3, Action::WatchExclusive, json!({"event": "leader"}));
        assert_eq!(response.value, Some(json!(true)));

        let db = handler.database().lock();
        assert_eq!(db.events.subscribers_of(&KeyPath::parse("leader")), vec![2]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_exact_subscribers() {
        let handler = CommandHandler::new(Arc::new(Mutex::new(Database::new())));
        let mut rx_a = connect(&handler, 2);
        let mut rx_b = connect(&handler, 3);
        let _rx_c = connect(&handler, 4);

        send(&handler, 2, Action::Watch, json!({"event": "news"}));
        send(&handler, 3, Action::Watch, json!({"event": "news.sports"}));

        let response = send(
            &handler,
            4,
            Action::Broadcast,
            json!({"event": "news", "value": {"headline": "hi"}}),
        );
        assert_eq!(response.event, Some(json!("news")));
        assert_eq!(response.value, Some(json!({"headline": "hi"})));

        let note = rx_a.recv().await.unwrap();
        assert_eq!(note.msg_type, "event");
        assert_eq!(note.event, json!("news"));
        assert_eq!(note.value, Some(json!({"headline": "hi"})));

        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_without_value() {
        let handler = test_handler();
        let response = send(&handler, 2, Action::Broadcast, json!({"event": "ping"}));
        assert!(response.is_ok());
        assert_eq!(response.value, None);
        assert_eq!(response.event, Some(json!("ping")));
    }

    #[test]
    fn test_metrics_recorded() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let handler = CommandHandler::new(Arc::new(Mutex::new(Database::new())))
            .with_metrics(metrics.clone());
        connect(&handler, 2);

        send(&handler, 2, Action::Get, json!({"key": "a"}));
        send(&handler, 2, Action::Watch, json!({"event": "a"}));
        send(&handler, 2, Action::Run, json!({"value": "1 / 0"}));

        assert_eq!(metrics.commands_total.with_label_values(&["get"]).get(), 1.0);
        assert_eq!(metrics.errors_total.with_label_values(&["script"]).get(), 1.0);
        assert_eq!(metrics.subscriptions_active.get(), 1.0);

        handler.on_disconnect(2);
        assert_eq!(metrics.subscriptions_active.get(), 0.0);
    }
}
