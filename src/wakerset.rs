use std::{collections::HashMap, default::Default, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing the wakers of every task awaiting a single
/// shared promise. Unlike a driven computation, a promise is settled from the
/// outside (by a batch dispatch), so there is no notion of a task that makes
/// progress on behalf of the others: every registered waker is woken exactly
/// once, when the promise settles.
///
/// Wakers are added to the set, and a token associated with the waker is
/// returned. The token is held by the waiting future and can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the set when the future is dropped
/// These tokens cannot be cloned or otherwise duplicated; this helps to ensure
/// that their lifespan is correctly associated with a particular future.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,

    // Tokens are an ever-increasing integer. A promise lives at most as long
    // as its scope, so there's no realistic chance of running out of these.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            next_token: NonZeroUsize::MIN,
        }
    }
}

impl WakerSet {
    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set. When the future is re-polled, use
    /// replace_waker with this token.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);

        self.wakers.insert(token.duplicate(), waker);
        token
    }

    /// Set a waker with an existing token in this set. The waker is passed
    /// by reference and is set with clone_from because it comes from a
    /// Context and would need to be cloned anyway. If the token is unknown
    /// (because the set was already drained), the waker is re-added.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        match self.wakers.get_mut(token) {
            Some(existing) => existing.clone_from(waker),
            None => {
                self.wakers.insert(token.duplicate(), waker.clone());
            }
        }
    }

    /// Discard a waker from this set. No-op if the token isn't present.
    pub(crate) fn discard_waker(&mut self, token: Token) {
        self.wakers.remove(&token);
    }

    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
