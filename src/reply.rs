//! Replies and callbacks
//!
//! A `Reply<T>` is the result half of a command: written once by the worker
//! that executed it and then handed to the command's callback.

use crate::classify::{classify, Classification};
use crate::error::DriverError;
use tokio::sync::oneshot;

/// Completion handler for a command producing `T`
pub type Callback<T> = Box<dyn FnOnce(Reply<T>) + Send + 'static>;

/// The classified result of one executed command
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    /// Target key or collection of the command
    pub key: String,
    /// Result value; the type's empty value on MISS and FAIL
    pub value: T,
    pub classification: Classification,
    /// Driver error, present unless the command succeeded
    pub error: Option<DriverError>,
}

impl<T> Reply<T> {
    /// Build a reply from an explicit value and error pair.
    pub fn new(key: impl Into<String>, value: T, error: Option<DriverError>) -> Self {
        Self {
            key: key.into(),
            classification: classify(error.as_ref()),
            value,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.classification.is_success()
    }

    pub fn is_miss(&self) -> bool {
        self.classification.is_miss()
    }

    pub fn is_fail(&self) -> bool {
        self.classification.is_fail()
    }

    /// Convert the value while keeping key, classification and error.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        Reply {
            key: self.key,
            value: f(self.value),
            classification: self.classification,
            error: self.error,
        }
    }
}

impl<T: Default> Reply<T> {
    /// Build a reply from a driver result.
    pub fn from_result(key: impl Into<String>, result: Result<T, DriverError>) -> Self {
        match result {
            Ok(value) => Self::new(key, value, None),
            Err(err) => Self::new(key, T::default(), Some(err)),
        }
    }
}

/// Create a callback that forwards its reply into a oneshot channel.
///
/// Lets async callers await a queued command instead of writing a closure.
/// The receiver yields an error if the command is abandoned before delivery.
pub fn channel<T: Send + 'static>() -> (
    impl FnOnce(Reply<T>) + Send + 'static,
    oneshot::Receiver<Reply<T>>,
) {
    let (tx, rx) = oneshot::channel();
    let callback = move |reply: Reply<T>| {
        let _ = tx.send(reply);
    };
    (callback, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result_miss_uses_default_value() {
        let reply: Reply<String> = Reply::from_result("k1", Err(DriverError::NotFound));
        assert_eq!(reply.key, "k1");
        assert_eq!(reply.value, "");
        assert_eq!(reply.classification, Classification::Miss);
        assert_eq!(reply.error, Some(DriverError::NotFound));
    }

    #[test]
    fn test_from_result_success() {
        let reply = Reply::from_result("k1", Ok("v1".to_string()));
        assert!(reply.is_success());
        assert_eq!(reply.value, "v1");
        assert!(reply.error.is_none());
    }

    #[test]
    fn test_map_keeps_classification() {
        let reply: Reply<u64> =
            Reply::from_result("k", Err(DriverError::Execution("down".to_string())));
        let mapped = reply.map(|n| n.to_string());
        assert!(mapped.is_fail());
        assert_eq!(mapped.value, "0");
    }

    #[tokio::test]
    async fn test_channel_forwards_reply() {
        let (callback, rx) = channel::<bool>();
        callback(Reply::new("k", true, None));
        let reply = rx.await.unwrap();
        assert!(reply.value);
        assert!(reply.is_success());
    }
}
