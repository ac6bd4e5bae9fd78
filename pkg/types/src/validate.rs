use anyhow::{Result, bail};

use crate::deployment::Deployment;
use crate::template::PodTemplate;

/// Validate a resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Validate a pod template before it is accepted into the store.
pub fn validate_template(template: &PodTemplate) -> Result<()> {
    if template.image.is_empty() {
        bail!("template image must not be empty");
    }
    let probe = &template.liveness_probe;
    if probe.period_secs == 0 {
        bail!("probe period must be at least 1 second");
    }
    if probe.success_threshold == 0 || probe.failure_threshold == 0 {
        bail!("probe thresholds must be at least 1");
    }
    Ok(())
}

/// Write-boundary validation for a Deployment. Rejecting here is what keeps
/// impossible targets (bad bounds, unusable strategies) out of the store, so
/// controllers never have to defend against them.
pub fn validate_deployment(deploy: &Deployment) -> Result<()> {
    validate_name(&deploy.name)?;
    validate_template(&deploy.spec.template)?;

    if deploy.spec.selector.is_empty() {
        bail!("deployment '{}' must have a non-empty selector", deploy.name);
    }

    let strategy = &deploy.spec.strategy;
    for (label, ratio) in [
        ("max_surge_ratio", strategy.max_surge_ratio),
        ("max_unavailable_ratio", strategy.max_unavailable_ratio),
    ] {
        if !(0.0..=1.0).contains(&ratio) {
            bail!("{} must be within [0, 1], got {}", label, ratio);
        }
    }
    if strategy.max_surge_ratio == 0.0 && strategy.max_unavailable_ratio == 0.0 {
        bail!("max_surge_ratio and max_unavailable_ratio cannot both be zero");
    }

    if let Some(autoscale) = &deploy.spec.autoscale {
        if autoscale.max_replicas == 0 {
            bail!("autoscale max_replicas must be at least 1");
        }
        if autoscale.min_replicas > autoscale.max_replicas {
            bail!(
                "autoscale min_replicas ({}) exceeds max_replicas ({})",
                autoscale.min_replicas,
                autoscale.max_replicas
            );
        }
        if autoscale.target_utilization_percent == 0 || autoscale.target_utilization_percent > 100 {
            bail!(
                "autoscale target utilization must be within (0, 100], got {}",
                autoscale.target_utilization_percent
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{AutoscalePolicy, DeploymentSpec, RolloutStrategy};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn make_deployment() -> Deployment {
        Deployment {
            id: "dep-1".to_string(),
            name: "iris-serve".to_string(),
            spec: DeploymentSpec {
                replicas: 2,
                template: PodTemplate {
                    image: "iris-serve:v1".to_string(),
                    resources: Default::default(),
                    liveness_probe: Default::default(),
                    env: BTreeMap::new(),
                    labels: BTreeMap::new(),
                },
                strategy: RolloutStrategy::default(),
                selector: BTreeMap::from([("app".to_string(), "iris".to_string())]),
                paused: false,
                rollback_requested: false,
                autoscale: None,
            },
            status: Default::default(),
            generation: 1,
            observed_generation: 0,
            active_replicaset: None,
            previous_replicaset: None,
            history: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn valid_names() {
        assert!(validate_name("nginx").is_ok());
        assert!(validate_name("iris-serve").is_ok());
        assert!(validate_name("app-123").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("My-App").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_valid_deployment_passes() {
        assert!(validate_deployment(&make_deployment()).is_ok());
    }

    #[test]
    fn test_empty_selector_rejected() {
        let mut deploy = make_deployment();
        deploy.spec.selector.clear();
        assert!(validate_deployment(&deploy).is_err());
    }

    #[test]
    fn test_zero_zero_strategy_rejected() {
        let mut deploy = make_deployment();
        deploy.spec.strategy.max_surge_ratio = 0.0;
        deploy.spec.strategy.max_unavailable_ratio = 0.0;
        assert!(validate_deployment(&deploy).is_err());
    }

    #[test]
    fn test_inverted_autoscale_bounds_rejected() {
        let mut deploy = make_deployment();
        deploy.spec.autoscale = Some(AutoscalePolicy {
            min_replicas: 5,
            max_replicas: 2,
            target_utilization_percent: 50,
            cooldown_secs: 60,
        });
        assert!(validate_deployment(&deploy).is_err());
    }

    #[test]
    fn test_utilization_out_of_range_rejected() {
        let mut deploy = make_deployment();
        deploy.spec.autoscale = Some(AutoscalePolicy {
            min_replicas: 1,
            max_replicas: 5,
            target_utilization_percent: 0,
            cooldown_secs: 60,
        });
        assert!(validate_deployment(&deploy).is_err());
    }
}
