// IBKR Client Portal Web API gateway.
//
// REST for session liveness, contract search and qualification; one websocket
// task for streaming quotes into the QuoteBook.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, trace, warn};

use super::client_portal_types::{
    month_code, occ_local_symbol, parse_market_data, smd_subscribe, smd_unsubscribe, AuthStatus,
    SecDefInfo, SecDefSearchEntry, StrikesResponse, Tickle,
};
use super::{Gateway, GatewayError, GatewayResult};
use crate::config::GatewaySettings;
use crate::engine::types::{parse_expiration, ChainDefinition, Contract, ContractSpec, Right};
use crate::market_data::normaliser::Normaliser;
use crate::market_data::quote_book::QuoteBook;

const FEED_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const FEED_HEARTBEAT: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum FeedCommand {
    Subscribe(Vec<i64>),
}

struct FeedHandle {
    commands: mpsc::UnboundedSender<FeedCommand>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ClientPortalGateway {
    base_url: String,
    ws_url: String,
    http: reqwest::Client,
    max_in_flight: usize,
    connected: AtomicBool,
    session: Mutex<Option<String>>,
    /// symbol -> underlying conid, filled by `resolve_underlying`
    underlyings: Mutex<AHashMap<String, i64>>,
    subscribed: Mutex<AHashSet<i64>>,
    feed: Mutex<Option<FeedHandle>>,
    book: QuoteBook,
}

impl ClientPortalGateway {
    pub fn new(settings: &GatewaySettings) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .gzip(true)
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        Ok(Self {
            base_url: settings.base_url(),
            ws_url: settings.websocket_url(),
            http,
            max_in_flight: settings.max_requests_in_flight.max(1),
            connected: AtomicBool::new(false),
            session: Mutex::new(None),
            underlyings: Mutex::new(AHashMap::new()),
            subscribed: Mutex::new(AHashSet::new()),
            feed: Mutex::new(None),
            book: QuoteBook::new(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> GatewayResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let res = self.http.get(&url).query(query).send().await?;
        let status = res.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::NotAuthenticated);
        }
        if !status.is_success() {
            return Err(GatewayError::Http(format!("{} on {}", status, path)));
        }
        Ok(res.json().await?)
    }

    async fn search(&self, symbol: &str, sec_type: &str) -> GatewayResult<SecDefSearchEntry> {
        let entries: Vec<SecDefSearchEntry> = self
            .get(
                "/iserver/secdef/search",
                &[("symbol", symbol.to_string()), ("secType", sec_type.to_string())],
            )
            .await?;

        entries
            .into_iter()
            .find(|e| e.conid > 0 && e.symbol.as_deref().map_or(true, |s| s == symbol))
            .ok_or_else(|| GatewayError::NotFound(format!("{} {}", sec_type, symbol)))
    }

    async fn underlying_conid(&self, symbol: &str) -> GatewayResult<i64> {
        if let Some(id) = self.underlyings.lock().get(symbol).copied() {
            return Ok(id);
        }
        let entry = self.search(symbol, "IND").await?;
        self.underlyings.lock().insert(symbol.to_string(), entry.conid);
        Ok(entry.conid)
    }

    async fn secdef_info(
        &self,
        underlying: i64,
        month: &str,
        exchange: &str,
        strike: f64,
        right: Right,
    ) -> GatewayResult<Vec<SecDefInfo>> {
        self.get(
            "/iserver/secdef/info",
            &[
                ("conid", underlying.to_string()),
                ("sectype", "OPT".to_string()),
                ("month", month.to_string()),
                ("exchange", exchange.to_string()),
                ("strike", strike.to_string()),
                ("right", right.code().to_string()),
            ],
        )
        .await
    }

    /// Strikes plus the (trading class, maturity) pairs listed for one option month.
    async fn month_chain(
        &self,
        underlying: i64,
        month: &str,
        exchange: &str,
    ) -> GatewayResult<(Vec<f64>, Vec<SecDefInfo>)> {
        let strikes: StrikesResponse = self
            .get(
                "/iserver/secdef/strikes",
                &[
                    ("conid", underlying.to_string()),
                    ("sectype", "OPT".to_string()),
                    ("month", month.to_string()),
                    ("exchange", exchange.to_string()),
                ],
            )
            .await?;

        let all = strikes.all();
        // Any listed strike reveals every maturity and trading class of the month.
        let Some(sample) = all.get(all.len() / 2).copied() else {
            return Ok((all, Vec::new()));
        };
        let infos = self.secdef_info(underlying, month, exchange, sample, Right::Call).await?;
        Ok((all, infos))
    }

    async fn qualify_one(&self, spec: &ContractSpec) -> GatewayResult<Option<Contract>> {
        let (Some(expiration), Some(strike), Some(right)) =
            (spec.expiration.as_deref(), spec.strike, spec.right)
        else {
            return Ok(None);
        };
        let (Some(month), Some(exp_date)) = (month_code(expiration), parse_expiration(expiration)) else {
            return Ok(None);
        };

        let underlying = self.underlying_conid(&spec.symbol).await?;
        let infos = self
            .secdef_info(underlying, &month, &spec.exchange, strike, right)
            .await?;

        let matches: Vec<&SecDefInfo> = infos
            .iter()
            .filter(|i| i.maturity_date.as_deref() == Some(expiration))
            .filter(|i| match (&spec.trading_class, &i.trading_class) {
                (Some(want), Some(got)) => want == got,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();

        match matches.as_slice() {
            [info] => {
                let class = info.trading_class.clone().unwrap_or_else(|| spec.symbol.clone());
                let mut qualified = spec.clone();
                qualified.trading_class = Some(class.clone());
                Ok(Some(Contract {
                    con_id: info.conid,
                    local_symbol: occ_local_symbol(&class, exp_date, right, strike),
                    spec: qualified,
                }))
            }
            [] => Ok(None),
            _ => {
                debug!(symbol = %spec.symbol, expiration, strike, %right, candidates = matches.len(), "ambiguous contract");
                Ok(None)
            }
        }
    }

    fn ensure_feed(&self) -> GatewayResult<mpsc::UnboundedSender<FeedCommand>> {
        let mut feed = self.feed.lock();
        if let Some(handle) = feed.as_ref() {
            return Ok(handle.commands.clone());
        }

        let session = self.session.lock().clone().ok_or(GatewayError::NotConnected)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let actor = QuoteFeed {
            ws_url: self.ws_url.clone(),
            session,
            book: self.book.clone(),
            normaliser: Normaliser::default(),
            commands: cmd_rx,
            stop: stop_rx,
            subscribed: Vec::new(),
        };
        let task = tokio::spawn(actor.run());

        *feed = Some(FeedHandle { commands: cmd_tx.clone(), stop: stop_tx, task });
        Ok(cmd_tx)
    }
}

#[async_trait::async_trait]
impl Gateway for ClientPortalGateway {
    #[instrument(skip(self))]
    async fn connect(&self, client_id: i32, timeout: Option<Duration>) -> GatewayResult<()> {
        let url = format!("{}/iserver/auth/status", self.base_url);
        let mut req = self.http.get(&url);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }

        let status: AuthStatus = req.send().await?.json().await?;
        if !status.authenticated {
            return Err(GatewayError::NotAuthenticated);
        }
        if !status.connected {
            // Session exists but the gateway is still reaching the brokerage.
            return Err(GatewayError::ConnectionRefused("brokerage session not connected yet".into()));
        }
        if status.competing {
            warn!("another session is competing for this login");
        }

        let tickle: Tickle = self.get("/tickle", &[]).await?;
        *self.session.lock() = Some(tickle.session);
        self.connected.store(true, Ordering::SeqCst);
        info!(client_id, base_url = %self.base_url, "gateway session established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        let handle = self.feed.lock().take();
        if let Some(handle) = handle {
            handle.stop.send_replace(true);
            if tokio::time::timeout(Duration::from_secs(5), handle.task).await.is_err() {
                warn!("quote feed did not stop in time");
            }
        }

        if self.connected.swap(false, Ordering::SeqCst) {
            let url = format!("{}/logout", self.base_url);
            if let Err(e) = self.http.post(&url).send().await {
                warn!(error = %e, "logout failed");
            }
        }
        self.subscribed.lock().clear();
        *self.session.lock() = None;
    }

    async fn resolve_underlying(&self, spec: &ContractSpec) -> GatewayResult<Contract> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let con_id = self.underlying_conid(&spec.symbol).await?;
        let contract = Contract { con_id, local_symbol: spec.symbol.clone(), spec: spec.clone() };
        self.subscribe_quotes(std::slice::from_ref(&contract)).await?;
        Ok(contract)
    }

    async fn chain_definitions(&self, underlying: &Contract, exchange: &str) -> GatewayResult<Vec<ChainDefinition>> {
        let entry = self.search(underlying.symbol(), "IND").await?;
        let months = entry.option_months();
        debug!(symbol = %underlying.symbol(), months = months.len(), exchange, "listing option months");

        let con_id = underlying.con_id;
        let results: Vec<GatewayResult<(Vec<f64>, Vec<SecDefInfo>)>> = futures::stream::iter(months)
            .map(|month| async move { self.month_chain(con_id, &month, exchange).await })
            .buffered(self.max_in_flight)
            .collect()
            .await;

        let mut by_class: BTreeMap<String, (BTreeSet<i64>, BTreeSet<String>)> = BTreeMap::new();
        for result in results {
            let (strikes, infos) = result?;
            for info in infos {
                let (Some(class), Some(maturity)) = (info.trading_class, info.maturity_date) else {
                    continue;
                };
                let entry = by_class.entry(class).or_default();
                // strikes keyed in thousandths so the set can order them
                entry.0.extend(strikes.iter().map(|s| (s * 1000.0).round() as i64));
                entry.1.insert(maturity);
            }
        }

        Ok(by_class
            .into_iter()
            .map(|(trading_class, (strikes, expirations))| ChainDefinition {
                trading_class,
                exchange: exchange.to_string(),
                strikes: strikes.into_iter().map(|s| s as f64 / 1000.0).collect(),
                expirations: expirations.into_iter().collect(),
            })
            .collect())
    }

    async fn qualify_contracts(&self, specs: &[ContractSpec]) -> GatewayResult<Vec<Contract>> {
        let results: Vec<GatewayResult<Option<Contract>>> = futures::stream::iter(specs.to_vec())
            .map(|spec| async move { self.qualify_one(&spec).await })
            .buffered(self.max_in_flight)
            .collect()
            .await;

        let mut qualified = Vec::with_capacity(specs.len());
        for result in results {
            match result {
                Ok(Some(c)) => qualified.push(c),
                Ok(None) => {}
                // lost the gateway: nothing after this will qualify either
                Err(e @ (GatewayError::ConnectionRefused(_) | GatewayError::NotAuthenticated)) => return Err(e),
                Err(e) => trace!(error = %e, "qualification failed"),
            }
        }
        Ok(qualified)
    }

    async fn subscribe_quotes(&self, contracts: &[Contract]) -> GatewayResult<usize> {
        if contracts.is_empty() {
            return Ok(0);
        }
        let commands = self.ensure_feed()?;
        let fresh: Vec<i64> = {
            let mut subscribed = self.subscribed.lock();
            contracts
                .iter()
                .map(|c| c.con_id)
                .filter(|id| subscribed.insert(*id))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(0);
        }

        for id in &fresh {
            self.book.track(*id);
        }
        commands
            .send(FeedCommand::Subscribe(fresh.clone()))
            .map_err(|_| GatewayError::WebSocket("quote feed stopped".into()))?;
        Ok(fresh.len())
    }

    fn quotes(&self) -> QuoteBook {
        self.book.clone()
    }
}

enum PumpExit {
    Stopped,
    Disconnected,
}

// Background task owning the websocket: reconnects, resubscribes, writes quotes.
struct QuoteFeed {
    ws_url: String,
    session: String,
    book: QuoteBook,
    normaliser: Normaliser,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    stop: watch::Receiver<bool>,
    subscribed: Vec<i64>,
}

impl QuoteFeed {
    async fn run(mut self) {
        loop {
            if *self.stop.borrow() {
                return;
            }
            info!(url = %self.ws_url, "connecting quote feed...");
            match self.open().await {
                Ok(ws) => {
                    if let PumpExit::Stopped = self.pump(ws).await {
                        return;
                    }
                }
                Err(e) => error!(error = %e, "quote feed connection failed"),
            }

            warn!("quote feed disconnected, reconnecting in 5 seconds...");
            tokio::select! {
                _ = tokio::time::sleep(FEED_RECONNECT_DELAY) => {}
                _ = self.stop.changed() => return,
            }
        }
    }

    async fn open(&self) -> GatewayResult<WsStream> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::WebSocket(e.to_string()))?;
        let cookie = HeaderValue::from_str(&format!("api={}", self.session))
            .map_err(|e| GatewayError::WebSocket(e.to_string()))?;
        request.headers_mut().insert("Cookie", cookie);

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| GatewayError::WebSocket(e.to_string()))?;
        Ok(ws)
    }

    async fn pump(&mut self, ws: WsStream) -> PumpExit {
        let (mut write, mut read) = ws.split();

        let hello = serde_json::json!({ "session": self.session }).to_string();
        if let Err(e) = write.send(Message::Text(hello)).await {
            error!(error = %e, "failed to send session");
            return PumpExit::Disconnected;
        }
        for id in &self.subscribed {
            if let Err(e) = write.send(Message::Text(smd_subscribe(*id))).await {
                error!(error = %e, "failed to resubscribe");
                return PumpExit::Disconnected;
            }
        }
        info!(subscriptions = self.subscribed.len(), "quote feed connected");

        let mut heartbeat = tokio::time::interval(FEED_HEARTBEAT);
        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    for id in &self.subscribed {
                        let _ = write.send(Message::Text(smd_unsubscribe(*id))).await;
                    }
                    let _ = write.send(Message::Close(None)).await;
                    return PumpExit::Stopped;
                }
                Some(cmd) = self.commands.recv() => match cmd {
                    FeedCommand::Subscribe(ids) => {
                        for id in ids {
                            if self.subscribed.contains(&id) {
                                continue;
                            }
                            self.subscribed.push(id);
                            if let Err(e) = write.send(Message::Text(smd_subscribe(id))).await {
                                error!(error = %e, "failed to subscribe");
                                return PumpExit::Disconnected;
                            }
                        }
                    }
                },
                _ = heartbeat.tick() => {
                    if write.send(Message::Text("tic".into())).await.is_err() {
                        return PumpExit::Disconnected;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_text(&text),
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(text) = String::from_utf8(bytes) {
                            self.on_text(&text);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("quote feed closed by gateway");
                        return PumpExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "quote feed error");
                        return PumpExit::Disconnected;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn on_text(&self, text: &str) {
        match parse_market_data(text, &self.normaliser) {
            Some(update) => {
                if !self.book.apply(update) {
                    debug!(con_id = update.con_id, "dropping quote for unsubscribed contract");
                }
            }
            None => trace!(%text, "ignoring feed message"),
        }
    }
}
