//! Retry-safe notification delivery.
//!
//! Implements the 3-state protocol per run and channel:
//! `pending -> claimed -> sent | failed`. The claim is an atomic
//! compare-and-set in the store; whoever wins it (a completing worker or a
//! retry tick) performs the send and settles the outcome. Failed sends are
//! rescheduled with exponential backoff until the attempt budget runs out,
//! after which the channel latches `failed`.
//!
//! Notification failures never touch task status: a completed run with a
//! dead webhook is still completed.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use relay_core::{NotificationChannel, NotificationStatus, TaskRunStatus};
use relay_queue::{NotificationContext, Store};

pub mod email;
pub mod webhook;

pub use email::{EmailMessage, HttpMailer, Mailer};

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub notification_max_attempts: i32,
    pub send_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            notification_max_attempts: 3,
            send_timeout: Duration::from_secs(10),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

/// `min(2^attempts * base, cap)`.
pub fn backoff_delay(attempts: i32, base: Duration, cap: Duration) -> Duration {
    let shift = attempts.clamp(0, 30) as u32;
    let factor = 1u64 << shift;
    base.checked_mul(factor as u32).unwrap_or(cap).min(cap)
}

pub struct Courier {
    store: Store,
    cfg: CourierConfig,
    mailer: Arc<dyn Mailer>,
    http: reqwest::Client,
}

impl Courier {
    pub fn new(store: Store, cfg: CourierConfig, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            store,
            cfg,
            mailer,
            http: reqwest::Client::new(),
        }
    }

    /// Deliver whatever is outstanding for one run. Called by a worker right
    /// after it settles the run; also reused by the retry loops. Channels
    /// already `sent` are skipped without a claim attempt.
    pub async fn deliver_for_run(&self, run_id: Uuid) -> anyhow::Result<()> {
        let Some(ctx) = self.store.notification_context(run_id).await? else {
            return Ok(());
        };

        if ctx.notify_email.is_some() && ctx.email_status != Some(NotificationStatus::Sent) {
            self.send_email(&ctx).await?;
        }
        if ctx.notify_webhook_url.is_some() && ctx.webhook_status != Some(NotificationStatus::Sent)
        {
            self.send_webhook(&ctx).await?;
        }

        Ok(())
    }

    /// One retry pass: pick up to `limit` rows whose failed channel is due
    /// and re-run the claim/send cycle for each. Safe to race with workers;
    /// the claim decides.
    pub async fn retry_pending(&self, limit: i64) -> anyhow::Result<usize> {
        let due = self
            .store
            .get_pending_notification_retries(limit, self.cfg.notification_max_attempts)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        tracing::info!(
            event = "relay.courier.retry_pass",
            count = due.len(),
            "processing notification retries"
        );

        let mut processed = 0;
        for retry in due {
            let Some(ctx) = self.store.notification_context(retry.run_id).await? else {
                continue;
            };

            if retry.email_due {
                if let Err(err) = self.send_email(&ctx).await {
                    tracing::warn!(
                        event = "relay.courier.email_retry.error",
                        run_id = %retry.run_id,
                        error = %err,
                        "email retry failed"
                    );
                }
            }
            if retry.webhook_due {
                if let Err(err) = self.send_webhook(&ctx).await {
                    tracing::warn!(
                        event = "relay.courier.webhook_retry.error",
                        run_id = %retry.run_id,
                        error = %err,
                        "webhook retry failed"
                    );
                }
            }
            processed += 1;
        }

        Ok(processed)
    }

    async fn send_email(&self, ctx: &NotificationContext) -> anyhow::Result<()> {
        let Some(to) = ctx.notify_email.as_deref() else {
            return Ok(());
        };

        let claimed = self
            .store
            .claim_notification_for_send(
                ctx.run_id,
                NotificationChannel::Email,
                self.cfg.notification_max_attempts,
            )
            .await?;
        if !claimed {
            tracing::debug!(
                event = "relay.courier.email.claim_lost",
                run_id = %ctx.run_id,
                "email notification already claimed or settled"
            );
            return Ok(());
        }

        let message = email::build_completion_email(to, ctx);
        let send_res = if self.mailer.is_configured() {
            self.mailer.send(&message).await
        } else {
            Err(anyhow::anyhow!("mail transport not configured"))
        };

        match send_res {
            Ok(()) => {
                self.store
                    .mark_notification_sent(ctx.run_id, NotificationChannel::Email)
                    .await?;
                tracing::info!(
                    event = "relay.courier.email.sent",
                    run_id = %ctx.run_id,
                    "completion email sent"
                );
            }
            Err(err) => {
                self.settle_failure(ctx.run_id, NotificationChannel::Email, &err)
                    .await?;
            }
        }

        Ok(())
    }

    async fn send_webhook(&self, ctx: &NotificationContext) -> anyhow::Result<()> {
        let Some(url) = ctx.notify_webhook_url.as_deref() else {
            return Ok(());
        };

        let claimed = self
            .store
            .claim_notification_for_send(
                ctx.run_id,
                NotificationChannel::Webhook,
                self.cfg.notification_max_attempts,
            )
            .await?;
        if !claimed {
            tracing::debug!(
                event = "relay.courier.webhook.claim_lost",
                run_id = %ctx.run_id,
                "webhook notification already claimed or settled"
            );
            return Ok(());
        }

        let payload = webhook::WebhookPayload::for_run(ctx);
        match webhook::post_webhook(&self.http, url, &payload, self.cfg.send_timeout).await {
            Ok(()) => {
                self.store
                    .mark_notification_sent(ctx.run_id, NotificationChannel::Webhook)
                    .await?;
                tracing::info!(
                    event = "relay.courier.webhook.sent",
                    run_id = %ctx.run_id,
                    "webhook delivered"
                );
            }
            Err(err) => {
                self.settle_failure(ctx.run_id, NotificationChannel::Webhook, &err)
                    .await?;
            }
        }

        Ok(())
    }

    async fn settle_failure(
        &self,
        run_id: Uuid,
        channel: NotificationChannel,
        err: &anyhow::Error,
    ) -> anyhow::Result<()> {
        let attempts = self
            .store
            .notification_attempts(run_id, channel)
            .await
            .context("read attempts after send failure")?;
        let delay = backoff_delay(attempts, self.cfg.backoff_base, self.cfg.backoff_cap);

        self.store
            .mark_notification_failed(
                run_id,
                channel,
                &format!("{err:#}"),
                self.cfg.notification_max_attempts,
                delay.as_secs() as i64,
            )
            .await?;

        tracing::warn!(
            event = "relay.courier.send.failed",
            run_id = %run_id,
            channel = channel.as_str(),
            attempts,
            retry_in_secs = delay.as_secs(),
            error = %err,
            "notification send failed"
        );
        Ok(())
    }
}

/// Wire status string for a terminal run in notification payloads.
pub(crate) fn status_label(status: TaskRunStatus) -> &'static str {
    status.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(600);
        assert_eq!(backoff_delay(0, base, cap), Duration::from_secs(30));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(120));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(240));
    }

    #[test]
    fn backoff_saturates_at_cap() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(600);
        assert_eq!(backoff_delay(5, base, cap), cap);
        assert_eq!(backoff_delay(30, base, cap), cap);
        assert_eq!(backoff_delay(1000, base, cap), cap);
    }
}
