//! Adaptive balance polling for incoming deposits

use crate::chain::TargetLedger;
use crate::error::{BridgeError, BridgeResult};

use ethers::types::{Address, U256};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct MonitorSchedule {
    /// Give up after this long without a positive balance
    pub deadline: Duration,
    pub poll_interval: Duration,
    /// Cap for the growing poll interval
    pub max_poll_interval: Duration,
}

impl Default for MonitorSchedule {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(60_000),
            poll_interval: Duration::from_millis(5_000),
            max_poll_interval: Duration::from_millis(30_000),
        }
    }
}

/// Poll `owner`'s balance of `token` until it is positive.
///
/// Every empty or failed poll stretches the interval by half, up to the cap.
pub async fn wait_for_balance(
    target: &dyn TargetLedger,
    token: Address,
    owner: Address,
    schedule: MonitorSchedule,
) -> BridgeResult<U256> {
    let deadline = Instant::now() + schedule.deadline;
    let mut interval = schedule.poll_interval;

    loop {
        match target.token_balance(token, owner).await {
            Ok(balance) if !balance.is_zero() => {
                debug!("Observed balance {} of {:?} at {:?}", balance, token, owner);
                return Ok(balance);
            }
            Ok(_) => debug!("No balance yet at {:?}, next poll in {:?}", owner, interval),
            Err(e) => warn!("Balance poll for {:?} failed: {}", owner, e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(BridgeError::NoDepositObserved {
                address: format!("{:?}", owner),
                deadline_ms: schedule.deadline.as_millis() as u64,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
        interval = interval.mul_f64(1.5).min(schedule.max_poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockTargetLedger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_positive_balance() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut target = MockTargetLedger::new();
        target.expect_token_balance().returning(move |_, _| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(U256::zero()),
                1 => Err(BridgeError::ChainConnection {
                    chain_id: 1,
                    message: "reset".to_string(),
                }),
                _ => Ok(U256::from(1_000_000u64)),
            }
        });

        let started = Instant::now();
        let balance = wait_for_balance(
            &target,
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            MonitorSchedule::default(),
        )
        .await
        .unwrap();

        assert_eq!(balance, U256::from(1_000_000u64));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 5s then 7.5s between the three polls
        assert_eq!(started.elapsed(), Duration::from_millis(12_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_deadline() {
        let mut target = MockTargetLedger::new();
        target
            .expect_token_balance()
            .returning(|_, _| Ok(U256::zero()));

        let schedule = MonitorSchedule {
            deadline: Duration::from_secs(20),
            poll_interval: Duration::from_secs(4),
            max_poll_interval: Duration::from_secs(6),
        };
        let started = Instant::now();
        let err = wait_for_balance(&target, Address::zero(), Address::zero(), schedule)
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::NoDepositObserved { deadline_ms: 20_000, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }
}
