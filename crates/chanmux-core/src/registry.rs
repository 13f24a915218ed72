//! Token-keyed service registry.
//!
//! A minimal locator: services are registered as ready values or as lazy
//! factories and fetched back by token with their concrete type. Factories
//! receive a [`Resolver`] so they can pull their own dependencies; a token
//! that is requested again while it is still being built fails with
//! [`MuxError::CircularDependency`].

use crate::rpc::RpcHandler;
use crate::{MuxError, Result};
use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace};

/// Key a service is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(String);

impl Token {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Token {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type AnyService = Arc<dyn Any + Send + Sync>;
type FactoryFn = Arc<dyn Fn(&Resolver<'_>) -> Result<AnyService> + Send + Sync>;

/// How a token's service is produced.
#[derive(Clone)]
pub enum Provider {
    /// Already built.
    Value(AnyService),
    /// Built on first lookup, then cached.
    Factory(FactoryFn),
}

impl Provider {
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Provider::Value(Arc::new(value))
    }

    pub fn instance<T: Any + Send + Sync>(instance: Arc<T>) -> Self {
        Provider::Value(instance)
    }

    pub fn factory<T, F>(factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&Resolver<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Provider::Factory(Arc::new(move |resolver: &Resolver<'_>| {
            factory(resolver).map(|service| Arc::new(service) as AnyService)
        }))
    }

    /// Factory for an RPC handler, retrievable with
    /// [`ServiceRegistry::get_handler`].
    pub fn handler<F>(factory: F) -> Self
    where
        F: Fn(&Resolver<'_>) -> Result<Arc<dyn RpcHandler>> + Send + Sync + 'static,
    {
        Self::factory(factory)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Value(_) => f.write_str("Provider::Value"),
            Provider::Factory(_) => f.write_str("Provider::Factory"),
        }
    }
}

/// Registry of services keyed by [`Token`].
#[derive(Default)]
pub struct ServiceRegistry {
    providers: RwLock<HashMap<Token, Provider>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready value, replacing any previous provider for `token`.
    pub fn add_value<T: Any + Send + Sync>(&self, token: impl Into<Token>, value: T) {
        self.insert(token.into(), Provider::value(value));
    }

    /// Register an already shared instance.
    pub fn add_instance<T: Any + Send + Sync>(&self, token: impl Into<Token>, instance: Arc<T>) {
        self.insert(token.into(), Provider::instance(instance));
    }

    /// Register a lazy factory.
    pub fn add_factory<T, F>(&self, token: impl Into<Token>, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&Resolver<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.insert(token.into(), Provider::factory(factory));
    }

    /// Register a lazy factory for an RPC handler.
    pub fn add_handler_factory<F>(&self, token: impl Into<Token>, factory: F)
    where
        F: Fn(&Resolver<'_>) -> Result<Arc<dyn RpcHandler>> + Send + Sync + 'static,
    {
        self.insert(token.into(), Provider::handler(factory));
    }

    /// Register a ready RPC handler.
    pub fn add_handler(&self, token: impl Into<Token>, handler: Arc<dyn RpcHandler>) {
        self.insert(token.into(), Provider::value(handler));
    }

    /// Register several providers at once.
    pub fn add_providers<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (Token, Provider)>,
    {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (token, provider) in entries {
            trace!("Registering provider {}", token);
            providers.insert(token, provider);
        }
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(token)
    }

    /// Fetch the service registered under `token` as a `T`.
    pub fn get<T: Any + Send + Sync>(&self, token: &Token) -> Result<Arc<T>> {
        Resolver::new(self).get(token)
    }

    /// Fetch an RPC handler registered with [`add_handler`](Self::add_handler)
    /// or [`add_handler_factory`](Self::add_handler_factory).
    pub fn get_handler(&self, token: &Token) -> Result<Arc<dyn RpcHandler>> {
        Resolver::new(self).get_handler(token)
    }

    fn insert(&self, token: Token, provider: Provider) {
        trace!("Registering provider {}", token);
        let previous = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), provider);
        if previous.is_some() {
            debug!("Replaced provider {}", token);
        }
    }

    fn provider(&self, token: &Token) -> Option<Provider> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    /// Cache a factory's product unless the token was re-registered or
    /// resolved concurrently in the meantime.
    fn cache(&self, token: &Token, built: AnyService) -> AnyService {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match providers.get(token) {
            Some(Provider::Value(existing)) => existing.clone(),
            _ => {
                providers.insert(token.clone(), Provider::Value(built.clone()));
                built
            }
        }
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut tokens: Vec<&Token> = providers.keys().collect();
        tokens.sort();
        f.debug_struct("ServiceRegistry")
            .field("tokens", &tokens)
            .finish()
    }
}

/// One resolution chain. Tracks the tokens being built so a factory that
/// (transitively) asks for itself fails instead of recursing.
pub struct Resolver<'a> {
    registry: &'a ServiceRegistry,
    building: RefCell<Vec<Token>>,
}

impl<'a> Resolver<'a> {
    fn new(registry: &'a ServiceRegistry) -> Self {
        Self {
            registry,
            building: RefCell::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        self.registry
    }

    pub fn get<T: Any + Send + Sync>(&self, token: &Token) -> Result<Arc<T>> {
        self.resolve(token)?
            .downcast::<T>()
            .map_err(|_| MuxError::ServiceTypeMismatch {
                token: token.to_string(),
                expected: type_name::<T>(),
            })
    }

    pub fn get_handler(&self, token: &Token) -> Result<Arc<dyn RpcHandler>> {
        self.get::<Arc<dyn RpcHandler>>(token)
            .map(|handler| handler.as_ref().clone())
    }

    fn resolve(&self, token: &Token) -> Result<AnyService> {
        let factory = match self.registry.provider(token) {
            Some(Provider::Value(service)) => return Ok(service),
            Some(Provider::Factory(factory)) => factory,
            None => {
                return Err(MuxError::ServiceNotFound {
                    token: token.to_string(),
                })
            }
        };

        if self.building.borrow().contains(token) {
            return Err(MuxError::CircularDependency {
                token: token.to_string(),
            });
        }

        debug!("Building service {}", token);
        self.building.borrow_mut().push(token.clone());
        let built = factory(self);
        self.building.borrow_mut().retain(|t| t != token);

        Ok(self.registry.cache(token, built?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Settings {
        name: String,
    }

    struct Greeter {
        settings: Arc<Settings>,
    }

    struct NullHandler;

    #[async_trait::async_trait]
    impl RpcHandler for NullHandler {
        async fn dispatch(&self, _method: &str, _params: Value) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_get_value() {
        let registry = ServiceRegistry::new();
        registry.add_value(
            "settings",
            Settings {
                name: "demo".into(),
            },
        );

        let settings = registry.get::<Settings>(&"settings".into()).unwrap();
        assert_eq!(settings.name, "demo");
        assert!(registry.contains(&"settings".into()));
    }

    #[test]
    fn test_missing_token() {
        let registry = ServiceRegistry::new();
        let err = registry.get::<Settings>(&"nope".into()).unwrap_err();
        assert!(matches!(err, MuxError::ServiceNotFound { token } if token == "nope"));
    }

    #[test]
    fn test_type_mismatch() {
        let registry = ServiceRegistry::new();
        registry.add_value("settings", 42u32);

        let err = registry.get::<Settings>(&"settings".into()).unwrap_err();
        assert!(matches!(err, MuxError::ServiceTypeMismatch { .. }));
    }

    #[test]
    fn test_factory_is_lazy_and_cached() {
        let registry = ServiceRegistry::new();
        let builds = Arc::new(AtomicUsize::new(0));
        registry.add_value(
            "settings",
            Settings {
                name: "lazy".into(),
            },
        );

        let counter = builds.clone();
        registry.add_factory("greeter", move |resolver| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Greeter {
                settings: resolver.get::<Settings>(&"settings".into())?,
            })
        });
        assert_eq!(builds.load(Ordering::SeqCst), 0);

        let first = registry.get::<Greeter>(&"greeter".into()).unwrap();
        let second = registry.get::<Greeter>(&"greeter".into()).unwrap();

        assert_eq!(first.settings.name, "lazy");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_circular_factories_are_detected() {
        let registry = ServiceRegistry::new();
        registry.add_factory("a", |resolver| {
            resolver.get::<u32>(&"b".into()).map(|b| *b + 1)
        });
        registry.add_factory("b", |resolver| {
            resolver.get::<u32>(&"a".into()).map(|a| *a + 1)
        });

        let err = registry.get::<u32>(&"a".into()).unwrap_err();
        assert!(matches!(err, MuxError::CircularDependency { token } if token == "a"));
        // Nothing half-built was cached
        assert!(registry.get::<u32>(&"b".into()).is_err());
    }

    #[test]
    fn test_failed_factory_can_be_retried() {
        let registry = ServiceRegistry::new();
        registry.add_factory("greeter", |resolver| {
            Ok(Greeter {
                settings: resolver.get::<Settings>(&"settings".into())?,
            })
        });

        assert!(registry.get::<Greeter>(&"greeter".into()).is_err());

        registry.add_value(
            "settings",
            Settings {
                name: "late".into(),
            },
        );
        let greeter = registry.get::<Greeter>(&"greeter".into()).unwrap();
        assert_eq!(greeter.settings.name, "late");
    }

    #[test]
    fn test_add_providers_and_handlers() {
        let registry = ServiceRegistry::new();
        registry.add_providers(vec![
            (Token::from("answer"), Provider::value(42u64)),
            (
                Token::from("handler"),
                Provider::handler(|_| Ok(Arc::new(NullHandler) as Arc<dyn RpcHandler>)),
            ),
        ]);

        assert_eq!(*registry.get::<u64>(&"answer".into()).unwrap(), 42);
        assert!(registry.get_handler(&"handler".into()).is_ok());
        assert!(matches!(
            registry.get_handler(&"answer".into()),
            Err(MuxError::ServiceTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_add_handler_ready_value() {
        let registry = ServiceRegistry::new();
        registry.add_handler("null", Arc::new(NullHandler));
        assert!(registry.get_handler(&Token::new("null")).is_ok());
    }
}
