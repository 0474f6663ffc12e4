/// Type-state markers for the engine builder
///
/// These types track at compile time whether the endpoint and the handler
/// have been supplied, so `build()` only exists once both are set.

use std::marker::PhantomData;

/// Marker trait for endpoint state
pub trait EndpointState {}

/// Endpoint URL has not been set
pub struct NoEndpoint;
impl EndpointState for NoEndpoint {}

/// Endpoint URL has been set
pub struct HasEndpoint;
impl EndpointState for HasEndpoint {}

/// Marker trait for handler state
pub trait HandlerState {}

/// Stream handler has not been set
pub struct NoHandler;
impl HandlerState for NoHandler {}

/// Stream handler has been set
pub struct HasHandler;
impl HandlerState for HasHandler {}

/// Phantom marker to prevent direct construction
#[derive(Debug, Clone, Copy)]
pub struct TypeState<E, H> {
    _endpoint: PhantomData<E>,
    _handler: PhantomData<H>,
}

impl<E, H> TypeState<E, H> {
    pub(crate) fn new() -> Self {
        Self {
            _endpoint: PhantomData,
            _handler: PhantomData,
        }
    }
}

impl<E, H> Default for TypeState<E, H> {
    fn default() -> Self {
        Self::new()
    }
}
