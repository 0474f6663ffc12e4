pub mod states;

use crate::core::config::EngineConfig;
use crate::core::engine::{Engine, EngineHandle};
use crate::core::transport::TcpConnector;
use crate::traits::*;
use states::*;

/// Type-state builder for [`Engine`]
///
/// The endpoint URL and the stream handler are required; everything else has
/// a default:
///
/// - subscription format: [`JsonMethodSubscription`] with the `@trade` suffix
/// - reconnect strategy: built from `config.reconnect`
/// - config: [`EngineConfig::default`]
pub struct EngineBuilder<E, Hs, H>
where
    E: EndpointState,
    Hs: HandlerState,
{
    _state: TypeState<E, Hs>,
    url: Option<String>,
    handler: Option<H>,
    formatter: Option<Box<dyn SubscriptionFormatter>>,
    reconnect_strategy: Option<Box<dyn ReconnectionStrategy>>,
    config: EngineConfig,
    topics: Vec<String>,
}

impl EngineBuilder<NoEndpoint, NoHandler, ()> {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            _state: TypeState::new(),
            url: None,
            handler: None,
            formatter: None,
            reconnect_strategy: None,
            config: EngineConfig::default(),
            topics: Vec::new(),
        }
    }
}

impl Default for EngineBuilder<NoEndpoint, NoHandler, ()> {
    fn default() -> Self {
        Self::new()
    }
}

// Endpoint setting
impl<Hs, H> EngineBuilder<NoEndpoint, Hs, H>
where
    Hs: HandlerState,
{
    /// `ws://` or `wss://` URL every connection is opened against
    pub fn url(self, url: impl Into<String>) -> EngineBuilder<HasEndpoint, Hs, H> {
        EngineBuilder {
            _state: TypeState::new(),
            url: Some(url.into()),
            handler: self.handler,
            formatter: self.formatter,
            reconnect_strategy: self.reconnect_strategy,
            config: self.config,
            topics: self.topics,
        }
    }
}

// Handler setting
impl<E> EngineBuilder<E, NoHandler, ()>
where
    E: EndpointState,
{
    pub fn handler<NewH>(self, handler: NewH) -> EngineBuilder<E, HasHandler, NewH>
    where
        NewH: StreamHandler,
    {
        EngineBuilder {
            _state: TypeState::new(),
            url: self.url,
            handler: Some(handler),
            formatter: self.formatter,
            reconnect_strategy: self.reconnect_strategy,
            config: self.config,
            topics: self.topics,
        }
    }
}

// Optional settings, available in any state
impl<E, Hs, H> EngineBuilder<E, Hs, H>
where
    E: EndpointState,
    Hs: HandlerState,
{
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// How subscribe/unsubscribe messages are built for a topic
    pub fn subscription<F>(mut self, formatter: F) -> Self
    where
        F: SubscriptionFormatter + 'static,
    {
        self.formatter = Some(Box::new(formatter));
        self
    }

    /// Override the strategy derived from `config.reconnect`
    pub fn reconnect_strategy<S>(mut self, strategy: S) -> Self
    where
        S: ReconnectionStrategy + 'static,
    {
        self.reconnect_strategy = Some(Box::new(strategy));
        self
    }

    /// Subscribe to `topic` as soon as the engine starts running
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }
}

// Build (only available once endpoint and handler are set)
impl<H> EngineBuilder<HasEndpoint, HasHandler, H>
where
    H: StreamHandler,
{
    /// Build an engine using plain TCP / native-tls transport
    pub fn build(self) -> Result<(Engine<TcpConnector, H>, EngineHandle)> {
        let connector = TcpConnector::new()?;
        self.build_with_connector(connector)
    }

    /// Build an engine on a custom transport
    pub fn build_with_connector<C>(self, connector: C) -> Result<(Engine<C, H>, EngineHandle)>
    where
        C: Connector,
    {
        let url = self
            .url
            .ok_or_else(|| StreamError::Configuration("Endpoint URL is required".to_string()))?;
        let endpoint = Endpoint::parse(&url)?;

        let handler = self
            .handler
            .ok_or_else(|| StreamError::Configuration("Stream handler is required".to_string()))?;

        let formatter: Box<dyn SubscriptionFormatter> = match self.formatter {
            Some(formatter) => formatter,
            None => Box::new(JsonMethodSubscription::default()),
        };

        let strategy = match self.reconnect_strategy {
            Some(strategy) => strategy,
            None => self.config.reconnect.strategy(),
        };

        Engine::new(
            connector,
            endpoint,
            handler,
            formatter,
            strategy,
            self.config,
            self.topics,
        )
    }
}
