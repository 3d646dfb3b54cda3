use {
    retry::delay::Exponential,
    std::{error::Error, future::Future, time::Duration},
    tracing::{error, warn},
};

///
/// Bounded exponential backoff applied to store round-trips.
///
/// Only transient failures are retried, see [`is_transient`].
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            factor: 10.0,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    ///
    /// A policy that gives up on the first failure.
    ///
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let millis = self.initial_delay.as_millis().max(1) as u64;
        Exponential::from_millis_with_factor(millis, self.factor).take(self.max_retries)
    }
}

///
/// Tells if an etcd failure is caused by "outside" forces, such as a network partition or an
/// overloaded cluster, and may succeed if tried again.
///
pub fn is_transient(err: &etcd_client::Error) -> bool {
    match err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            tonic::Code::Unknown => status.source().is_none(),
            tonic::Code::DeadlineExceeded
            | tonic::Code::ResourceExhausted
            | tonic::Code::Internal
            | tonic::Code::Unavailable
            | tonic::Code::DataLoss => true,
            _ => false,
        },
        etcd_client::Error::TransportError(_) => true,
        _ => false,
    }
}

///
/// Runs an etcd operation, retrying it according to `policy` while it fails with a transient error.
///
/// `reusable_args` are cloned for every attempt, `f` builds the future of one attempt from a client handle.
///
/// ```ignore
/// let resp = retry_etcd(etcd, RetryPolicy::default(), (key,), |mut etcd, (key,)| async move {
///     etcd.get(key, None).await
/// })
/// .await?;
/// ```
///
pub async fn retry_etcd<A, T, F, Fut>(
    etcd: etcd_client::Client,
    policy: RetryPolicy,
    reusable_args: A,
    mut f: F,
) -> Result<T, etcd_client::Error>
where
    A: Clone + Send + 'static,
    Fut: Future<Output = Result<T, etcd_client::Error>> + Send + 'static,
    F: FnMut(etcd_client::Client, A) -> Fut,
    T: Send + 'static,
{
    let mut delays = policy.delays();
    loop {
        match f(etcd.clone(), reusable_args.clone()).await {
            Ok(o) => return Ok(o),
            Err(e) if is_transient(&e) => {
                warn!("etcd call failed due to transient state {:?}", e);
                match delays.next() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(e),
                }
            }
            Err(e) => {
                error!("etcd call failed due to non-transient state: {:?}", e);
                return Err(e);
            }
        }
    }
}

pub async fn retry_etcd_txn(
    etcd: etcd_client::Client,
    policy: RetryPolicy,
    txn: etcd_client::Txn,
) -> Result<etcd_client::TxnResponse, etcd_client::Error> {
    retry_etcd(etcd, policy, (txn,), move |etcd, (txn,)| async move {
        etcd.kv_client().txn(txn).await
    })
    .await
}

pub async fn retry_etcd_get(
    etcd: etcd_client::Client,
    policy: RetryPolicy,
    key: String,
    opts: Option<etcd_client::GetOptions>,
) -> Result<etcd_client::GetResponse, etcd_client::Error> {
    retry_etcd(etcd, policy, (key, opts), move |etcd, (key, opts)| async move {
        etcd.kv_client().get(key, opts).await
    })
    .await
}
