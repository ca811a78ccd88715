use rand::Rng;

use mgate_common::{GatewayError, GatewayResult, Provider, RequestContext, keys};

use crate::credential::Credential;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SelectKeyError {
    #[error("no keys configured for provider {0}")]
    NoKeysForProvider(Provider),
    #[error("no keys support model {model} for provider {provider}")]
    NoKeysSupportModel { provider: Provider, model: String },
    #[error("no keys support model or deployment {model} for provider {provider}")]
    NoKeysSupportModelOrDeployment { provider: Provider, model: String },
}

impl From<SelectKeyError> for GatewayError {
    fn from(err: SelectKeyError) -> Self {
        GatewayError::key_selection(err.to_string())
    }
}

/// Picks one credential out of an eligible, non-empty candidate set.
pub trait KeySelector: Send + Sync {
    fn select(
        &self,
        ctx: &RequestContext,
        provider: &Provider,
        model: &str,
        candidates: &[Credential],
    ) -> Credential;
}

/// Default selector: weighted random over integer weights `round(weight*100)`.
/// All-zero weights degrade to a uniform pick.
#[derive(Debug, Default)]
pub struct WeightedRandomSelector;

impl KeySelector for WeightedRandomSelector {
    fn select(
        &self,
        _ctx: &RequestContext,
        _provider: &Provider,
        _model: &str,
        candidates: &[Credential],
    ) -> Credential {
        let weights: Vec<u64> = candidates
            .iter()
            .map(|key| (key.weight * 100.0).round().max(0.0) as u64)
            .collect();
        let total: u64 = weights.iter().sum();

        let mut rng = rand::rng();
        if total == 0 {
            let index = rng.random_range(0..candidates.len());
            return candidates[index].clone();
        }

        let mut point = rng.random_range(0..total);
        for (key, weight) in candidates.iter().zip(weights) {
            if point < weight {
                return key.clone();
            }
            point -= weight;
        }
        // Unreachable while total == sum(weights); keep the last as backstop.
        candidates[candidates.len() - 1].clone()
    }
}

/// The key-selection procedure for one attempt.
///
/// A direct key pinned in the context wins outright. Otherwise the eligible
/// candidates are narrowed per the base provider's rules; a single survivor
/// is returned without consulting the selector.
pub fn select_key(
    ctx: &RequestContext,
    selector: &dyn KeySelector,
    provider: &Provider,
    model: &str,
    base_provider: &Provider,
    all_keys: &[Credential],
) -> GatewayResult<Credential> {
    if let Some(direct) = ctx.get::<Credential>(keys::DIRECT_KEY) {
        return Ok(direct);
    }

    if all_keys.is_empty() {
        return Err(SelectKeyError::NoKeysForProvider(provider.clone()).into());
    }

    let eligible: Vec<Credential> = all_keys
        .iter()
        .filter(|key| key.eligible(model, base_provider))
        .cloned()
        .collect();

    if eligible.is_empty() {
        let err = if base_provider.uses_deployments() {
            SelectKeyError::NoKeysSupportModelOrDeployment {
                provider: provider.clone(),
                model: model.to_string(),
            }
        } else {
            SelectKeyError::NoKeysSupportModel {
                provider: provider.clone(),
                model: model.to_string(),
            }
        };
        return Err(err.into());
    }

    if eligible.len() == 1 {
        return Ok(eligible.into_iter().next().expect("len checked"));
    }

    Ok(selector.select(ctx, provider, model, &eligible))
}
