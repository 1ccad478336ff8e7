//! In-flight request bookkeeping shared by deduplicated callers.

// std
use std::{
	fmt::{Debug, Formatter, Result as FmtResult},
	future::Future,
	pin::Pin,
	task::{Context, Poll},
};
// crates.io
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
// self
use crate::_prelude::*;

pub(crate) type SharedFetch<T> = Shared<BoxFuture<'static, Result<Arc<T>>>>;

/// Why a fetch was issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOrigin {
	/// A caller is waiting on the result.
	Foreground,
	/// Revalidation of a stale entry; nobody waits on the result.
	Background,
}

/// A request registered in the in-flight table.
pub(crate) struct InFlightRequest<T> {
	pub(crate) id: u64,
	pub(crate) origin: FetchOrigin,
	pub(crate) fetch: SharedFetch<T>,
	pub(crate) token: CancellationToken,
}
impl<T> InFlightRequest<T> {
	pub(crate) fn new(
		id: u64,
		origin: FetchOrigin,
		fetch: BoxFuture<'static, Result<Arc<T>>>,
		token: CancellationToken,
	) -> Self {
		Self { id, origin, fetch: fetch.shared(), token }
	}

	pub(crate) fn pending(&self) -> PendingFetch<T> {
		PendingFetch { id: self.id, fetch: self.fetch.clone() }
	}

	pub(crate) fn cancel(&self) {
		self.token.cancel();
	}
}
impl<T> Debug for InFlightRequest<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("InFlightRequest")
			.field("id", &self.id)
			.field("origin", &self.origin)
			.field("cancelled", &self.token.is_cancelled())
			.finish()
	}
}

/// Awaitable handle on an in-flight request.
///
/// Every caller that joins the same request holds a handle on the same underlying
/// future; [`PendingFetch::is_same_request`] exposes that identity.
pub struct PendingFetch<T> {
	id: u64,
	fetch: SharedFetch<T>,
}
impl<T> PendingFetch<T> {
	/// Identifier of the underlying request, unique per cache.
	pub fn request_id(&self) -> u64 {
		self.id
	}

	/// Whether both handles observe the same underlying request.
	pub fn is_same_request(&self, other: &Self) -> bool {
		self.id == other.id && self.fetch.ptr_eq(&other.fetch)
	}
}
impl<T> Clone for PendingFetch<T> {
	fn clone(&self) -> Self {
		Self { id: self.id, fetch: self.fetch.clone() }
	}
}
impl<T> Debug for PendingFetch<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("PendingFetch").field("id", &self.id).finish()
	}
}
impl<T> Future for PendingFetch<T> {
	type Output = Result<Arc<T>>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.fetch).poll(cx)
	}
}
