//! First-success dialing.

use crate::error::{Error, Result};

use std::future::Future;

/// Run the attempt producers in order, returning the first success.
///
/// An empty input fails with [`Error::NoAttemptsMade`]; if every attempt
/// fails the failures are collected into [`Error::AttemptsFailed`].
pub async fn try_each<T, F, Fut, I>(attempts: I) -> Result<T>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = Vec::new();
    let mut any = false;

    for attempt in attempts {
        any = true;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(reason) => {
                log::debug!("connection attempt failed: reason={}", reason);
                failures.push(reason.to_string());
            }
        }
    }

    if any {
        Err(Error::AttemptsFailed(failures))
    } else {
        Err(Error::NoAttemptsMade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Attempt<T> = fn() -> std::future::Ready<Result<T>>;

    #[test]
    fn empty_input_means_no_attempts_were_made() {
        let attempts: Vec<Attempt<()>> = vec![];
        let result = block_on(try_each(attempts));
        assert!(matches!(result, Err(Error::NoAttemptsMade)));
    }

    #[test]
    fn first_success_wins_and_later_attempts_never_run() {
        let attempts: Vec<Attempt<u32>> = vec![
            || std::future::ready(Err(Error::Connection("one".to_string()))),
            || std::future::ready(Ok(2)),
            || panic!("must not be attempted"),
        ];

        assert_eq!(block_on(try_each(attempts)).unwrap(), 2);
    }

    #[test]
    fn all_failures_are_collected_in_order() {
        let attempts: Vec<Attempt<u32>> = vec![
            || std::future::ready(Err(Error::Connection("one".to_string()))),
            || std::future::ready(Err(Error::Connection("two".to_string()))),
        ];

        match block_on(try_each(attempts)) {
            Err(Error::AttemptsFailed(reasons)) => {
                assert_eq!(reasons.len(), 2);
                assert!(reasons[0].contains("one"));
                assert!(reasons[1].contains("two"));
            }
            other => panic!("wrong result: {:?}", other),
        }
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }
}
