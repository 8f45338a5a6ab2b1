use futures::future::BoxFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs every future concurrently and returns the index and output of the
/// first to settle; the rest are dropped (cancelled) once the winner is
/// known. This is the one "when-any" combinator design note §9 asks the
/// router and the blocker to share, instead of each hand-rolling its own
/// nested select.
pub async fn race<T>(futures: Vec<BoxFuture<'_, T>>) -> (usize, T) {
    let mut remaining: Vec<_> = futures.into_iter().enumerate().collect();
    loop {
        let polled = remaining
            .iter_mut()
            .map(|(i, f)| (*i, f))
            .collect::<Vec<_>>();
        let (idx, output) = select_first(polled).await;
        return (idx, output);
    }
}

async fn select_first<'a, T>(mut items: Vec<(usize, &mut BoxFuture<'a, T>)>) -> (usize, T) {
    use std::future::poll_fn;
    use std::task::Poll;

    poll_fn(move |cx| {
        for (idx, fut) in items.iter_mut() {
            if let Poll::Ready(out) = fut.as_mut().poll(cx) {
                return Poll::Ready((*idx, out));
            }
        }
        Poll::Pending
    })
    .await
}

/// A cancellable, deadline-bound wait: races `fut` against a sleep of
/// `timeout`, wired to `token` so an external cancellation (caller interrupt
/// or blocker shutdown, per spec §5) preempts either side.
pub async fn race_with_deadline<T>(
    fut: BoxFuture<'_, T>,
    timeout: Duration,
    token: CancellationToken,
) -> RaceOutcome<T> {
    let sleep = tokio::time::sleep(timeout);
    tokio::select! {
        biased;
        _ = token.cancelled() => RaceOutcome::Cancelled,
        out = fut => RaceOutcome::Settled(out),
        _ = sleep => RaceOutcome::TimedOut,
    }
}

#[derive(Debug)]
pub enum RaceOutcome<T> {
    Settled(T),
    TimedOut,
    Cancelled,
}
