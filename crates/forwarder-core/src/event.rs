//! A small pub/sub primitive used to wire listeners, upstream clients, and the
//! forwarder together without either side owning the other.
//!
//! Two subscriber flavors are supported: a handler tied to an owner's
//! lifetime via a [`Weak`] reference (reaped automatically once the owner is
//! dropped), and a free-standing handler keyed by the [`SubscriptionToken`]
//! returned from `subscribe`. Both are invoked synchronously from `invoke`,
//! under a shared lock; (un)subscribe takes the exclusive lock.

use std::sync::{
	Arc, RwLock, Weak,
	atomic::{AtomicU64, Ordering},
};

/// Opaque handle returned by `subscribe`/`subscribe_weak`, presented back to
/// `unsubscribe`. Never compare it by any means other than equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Probe<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

pub struct Event<T> {
	next_token: AtomicU64,
	subscribers: RwLock<Vec<(SubscriptionToken, Probe<T>)>>,
}

impl<T> Default for Event<T> {
	fn default() -> Self {
		Self {
			next_token: AtomicU64::new(0),
			subscribers: RwLock::new(Vec::new()),
		}
	}
}

impl<T> Event<T> {
	pub fn new() -> Self {
		Self::default()
	}

	fn issue_token(&self) -> SubscriptionToken {
		SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed))
	}

	/// Subscribes a handler tied to `owner`'s lifetime. On each `invoke`, the
	/// weak reference is upgraded first; if `owner` has been dropped, the
	/// entry is silently collected instead of firing.
	pub fn subscribe_weak<O>(&self, owner: &Arc<O>, handler: impl Fn(&O, &T) + Send + Sync + 'static) -> SubscriptionToken
	where
		O: Send + Sync + 'static,
	{
		let weak: Weak<O> = Arc::downgrade(owner);
		let token = self.issue_token();
		let probe: Probe<T> = Box::new(move |args| match weak.upgrade() {
			Some(owner) => {
				handler(&owner, args);
				true
			}
			None => false,
		});
		self.subscribers.write().unwrap().push((token, probe));
		token
	}

	/// Subscribes a free-standing handler (closure or free function). Unlike
	/// [`Event::subscribe_weak`] it is never reaped implicitly — call
	/// [`Event::unsubscribe`] with the returned token.
	pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionToken {
		let token = self.issue_token();
		let probe: Probe<T> = Box::new(move |args| {
			handler(args);
			true
		});
		self.subscribers.write().unwrap().push((token, probe));
		token
	}

	pub fn unsubscribe(&self, token: SubscriptionToken) {
		self.subscribers.write().unwrap().retain(|(t, _)| *t != token);
	}

	/// Dispatches to every live subscriber. Subscribers whose owner has
	/// expired are collected after the shared critical section.
	pub fn invoke(&self, args: &T) {
		let mut expired = Vec::new();
		{
			let subs = self.subscribers.read().unwrap();
			for (token, probe) in subs.iter() {
				if !probe(args) {
					expired.push(*token);
				}
			}
		}
		if !expired.is_empty() {
			self.subscribers.write().unwrap().retain(|(t, _)| !expired.contains(t));
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.read().unwrap().len()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Arc,
		atomic::{AtomicU32, Ordering},
	};

	use super::*;

	#[test]
	fn keyed_subscriber_fires_on_invoke() {
		let event: Event<u32> = Event::new();
		let seen = Arc::new(AtomicU32::new(0));
		let seen_clone = seen.clone();
		event.subscribe(move |v| {
			seen_clone.fetch_add(*v, Ordering::SeqCst);
		});
		event.invoke(&5);
		event.invoke(&7);
		assert_eq!(seen.load(Ordering::SeqCst), 12);
	}

	#[test]
	fn unsubscribe_stops_delivery() {
		let event: Event<u32> = Event::new();
		let seen = Arc::new(AtomicU32::new(0));
		let seen_clone = seen.clone();
		let token = event.subscribe(move |v| {
			seen_clone.fetch_add(*v, Ordering::SeqCst);
		});
		event.unsubscribe(token);
		event.invoke(&5);
		assert_eq!(seen.load(Ordering::SeqCst), 0);
	}

	struct Owner {
		total: AtomicU32,
	}

	#[test]
	fn weak_subscriber_is_reaped_after_owner_drops() {
		let event: Event<u32> = Event::new();
		let owner = Arc::new(Owner { total: AtomicU32::new(0) });
		event.subscribe_weak(&owner, |owner, v| {
			owner.total.fetch_add(*v, Ordering::SeqCst);
		});
		event.invoke(&3);
		assert_eq!(owner.total.load(Ordering::SeqCst), 3);
		assert_eq!(event.subscriber_count(), 1);

		drop(owner);
		event.invoke(&3); // no owner left; probe returns false and is reaped
		assert_eq!(event.subscriber_count(), 0);
	}
}
