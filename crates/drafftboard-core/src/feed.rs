//! Single-threaded notification feeds.
//!
//! A [`Feed`] only keeps weak references to its subscribers' queues, so
//! dropping a [`Subscription`] is all it takes to unsubscribe.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

type Queue<T> = RefCell<VecDeque<T>>;

/// Receiving end of a feed.
#[derive(Debug)]
pub struct Subscription<T> {
    queue: Rc<Queue<T>>,
}

impl<T> Subscription<T> {
    /// Take every item delivered since the last drain, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

/// Sending end of a feed.
#[derive(Debug)]
pub struct Feed<T> {
    subscribers: Vec<Weak<Queue<T>>>,
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<T: Clone> Feed<T> {
    pub fn subscribe(&mut self) -> Subscription<T> {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        self.subscribers.push(Rc::downgrade(&queue));
        Subscription { queue }
    }

    /// Deliver an item to every live subscriber, pruning dropped ones.
    pub fn publish(&mut self, item: T) {
        self.subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.borrow_mut().push_back(item.clone());
                true
            }
            None => false,
        });
    }

    /// Number of subscriptions that are still alive.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
