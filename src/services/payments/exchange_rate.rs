use super::gateway::GatewayError;
use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExchangeRateProvider: Send + Sync {
    async fn convert(&self, from: &str, to: &str, amount: Decimal) -> Result<Decimal, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    result: Option<Decimal>,
}

/// FX API client: `GET {api_url}?from=..&to=..&amount=..` returning `{"result": n}`.
#[derive(Clone)]
pub struct HttpExchangeRateProvider {
    client: reqwest::Client,
    api_url: String,
}

impl HttpExchangeRateProvider {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.into(),
        })
    }
}

#[async_trait]
impl ExchangeRateProvider for HttpExchangeRateProvider {
    async fn convert(&self, from: &str, to: &str, amount: Decimal) -> Result<Decimal, GatewayError> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("from", from.to_string()),
                ("to", to.to_string()),
                ("amount", amount.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: "exchange rate lookup failed".to_string(),
            });
        }

        let body: ConvertResponse = response.json().await?;
        match body.result {
            Some(result) if result > Decimal::ZERO => Ok(result),
            _ => Err(GatewayError::MalformedResponse(
                "missing conversion result".to_string(),
            )),
        }
    }
}

/// Converts local prices to the settlement currency. Never fails: if the
/// provider is unavailable the configured fallback rate is used.
#[derive(Clone)]
pub struct CurrencyConverter {
    provider: Arc<dyn ExchangeRateProvider>,
    from: String,
    to: String,
    fallback_rate: Decimal,
}

impl CurrencyConverter {
    pub fn new(
        provider: Arc<dyn ExchangeRateProvider>,
        from: impl Into<String>,
        to: impl Into<String>,
        fallback_rate: Decimal,
    ) -> Self {
        Self {
            provider,
            from: from.into(),
            to: to.into(),
            fallback_rate,
        }
    }

    pub fn settlement_currency(&self) -> &str {
        &self.to
    }

    /// `amount` in the settlement currency, rounded to cents.
    pub async fn convert(&self, amount: Decimal) -> Decimal {
        if self.from.eq_ignore_ascii_case(&self.to) {
            return round_money(amount);
        }

        let converted = match self.provider.convert(&self.from, &self.to, amount).await {
            Ok(value) => {
                debug!(%amount, %value, from = %self.from, to = %self.to, "Converted amount");
                value
            }
            Err(e) => {
                warn!(
                    %amount,
                    error = %e,
                    fallback_rate = %self.fallback_rate,
                    "Exchange rate lookup failed, using fallback rate"
                );
                metrics::counter!("course_market.fx.fallback", 1);
                amount * self.fallback_rate
            }
        };

        round_money(converted)
    }
}

fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
