//! Minimalistic, type-safe ClientHub.
//!
//! Design goals:
//! - Initializers publish a client once (a connection handle, a metrics registry, ...).
//! - Consumers fetch by *interface type* (trait object or concrete): `get::<dyn my::Api>()`.
//! - Optional scopes (e.g., several connections of one kind): `with_scoped / get_scoped`.
//!
//! Implementation details:
//! - The hub is an immutable, append-only chain. `with` returns a new hub that
//!   shares its parent; the receiver is never mutated, so two holders can't race.
//! - Key = (type name, scope). We use `type_name::<T>()`, which works for `T = dyn Trait`.
//! - Value = `Arc<T>` stored as `Box<dyn Any + Send + Sync>` (downcast on read).
//! - Lookups walk from the newest node, so a later registration shadows an earlier one.

use std::{any::Any, fmt, sync::Arc};

/// Stable type key for trait objects: the fully-qualified `type_name::<T>()`.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct TypeKey(&'static str);

impl TypeKey {
    #[inline]
    fn of<T: ?Sized + 'static>() -> Self {
        TypeKey(std::any::type_name::<T>())
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Optional scope (e.g., `primary`, `audit`).
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct ScopeKey(Option<Arc<str>>);

impl ScopeKey {
    #[inline]
    fn global() -> Self {
        ScopeKey(None)
    }
    #[inline]
    fn named(s: impl Into<Arc<str>>) -> Self {
        ScopeKey(Some(s.into()))
    }
}

impl fmt::Debug for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("global"),
            Some(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientHubError {
    #[error("client not found: type={type_key:?}, scope={scope:?}")]
    NotFound { type_key: TypeKey, scope: ScopeKey },

    #[error("type mismatch in hub for type={type_key:?}, scope={scope:?}")]
    TypeMismatch { type_key: TypeKey, scope: ScopeKey },
}

type Boxed = Box<dyn Any + Send + Sync>;

struct Node {
    type_key: TypeKey,
    scope: ScopeKey,
    value: Boxed,
    parent: Option<Arc<Node>>,
}

/// Type-safe, copy-on-extend registry of clients keyed by (interface type, scope).
#[derive(Clone, Default)]
pub struct ClientHub {
    head: Option<Arc<Node>>,
}

impl ClientHub {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a hub that additionally holds `client` in the *global* scope under `T`.
    #[must_use]
    pub fn with<T>(&self, client: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.push(TypeKey::of::<T>(), ScopeKey::global(), Box::new(client))
    }

    /// Returns a hub that additionally holds `client` in a *named* scope under `T`.
    #[must_use]
    pub fn with_scoped<T>(&self, scope: impl Into<Arc<str>>, client: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.push(TypeKey::of::<T>(), ScopeKey::named(scope), Box::new(client))
    }

    fn push(&self, type_key: TypeKey, scope: ScopeKey, value: Boxed) -> Self {
        Self {
            head: Some(Arc::new(Node {
                type_key,
                scope,
                value,
                parent: self.head.clone(),
            })),
        }
    }

    /// Fetch a client from the *global* scope by interface type `T`.
    pub fn get<T>(&self) -> Result<Arc<T>, ClientHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.lookup::<T>(ScopeKey::global())
    }

    /// Fetch a client from a *named* scope by interface type `T`.
    pub fn get_scoped<T>(&self, scope: impl Into<Arc<str>>) -> Result<Arc<T>, ClientHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.lookup::<T>(ScopeKey::named(scope))
    }

    fn lookup<T>(&self, scope: ScopeKey) -> Result<Arc<T>, ClientHubError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let type_key = TypeKey::of::<T>();
        let node = self
            .nodes()
            .find(|n| n.type_key == type_key && n.scope == scope)
            .ok_or_else(|| ClientHubError::NotFound {
                type_key: type_key.clone(),
                scope: scope.clone(),
            })?;

        // Stored value is exactly `Arc<T>`; downcast is safe and cheap.
        node.value
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or(ClientHubError::TypeMismatch { type_key, scope })
    }

    /// Whether a client is registered for `T` in the global scope.
    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get::<T>().is_ok()
    }

    /// Introspection: total entries, shadowed ones included.
    pub fn len(&self) -> usize {
        self.nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        std::iter::successors(self.head.as_deref(), |n| n.parent.as_deref())
    }
}

impl fmt::Debug for ClientHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes().map(|n| (&n.type_key, &n.scope)))
            .finish()
    }
}
