use anyhow::ensure;
use clap::ArgAction;
use serde::Serialize;
use serde_json::Value;

/// Fully populated, type-correct sampling parameters for one generation.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct GenerationParameters {
    pub max_new_tokens: u32,
    pub do_sample: bool,
    pub temperature: f32,
    pub top_p: f32,
}

impl GenerationParameters {
    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.max_new_tokens > 0, "max_new_tokens must be positive");
        ensure!(valid_temperature(self.temperature), "temperature must be positive");
        ensure!(valid_top_p(self.top_p), "top_p must be in (0, 1]");
        Ok(())
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct DefaultsArgs {
    #[arg(long, env = "PALMA_DEFAULT_MAX_NEW_TOKENS", default_value_t = 256)]
    pub default_max_new_tokens: u32,
    #[arg(long, env = "PALMA_DEFAULT_DO_SAMPLE", default_value_t = false, action = ArgAction::Set)]
    pub default_do_sample: bool,
    #[arg(long, env = "PALMA_DEFAULT_TEMPERATURE", default_value_t = 0.6)]
    pub default_temperature: f32,
    #[arg(long, env = "PALMA_DEFAULT_TOP_P", default_value_t = 0.9)]
    pub default_top_p: f32,
}

impl DefaultsArgs {
    pub fn to_defaults(&self) -> anyhow::Result<GenerationParameters> {
        let defaults = GenerationParameters {
            max_new_tokens: self.default_max_new_tokens,
            do_sample: self.default_do_sample,
            temperature: self.default_temperature,
            top_p: self.default_top_p,
        };
        defaults.validate()?;
        Ok(defaults)
    }
}

/// Reads the sampling overrides of a request body.
///
/// Absent fields, fields of the wrong JSON type, and out-of-range values all
/// fall back to `defaults`. This never fails.
pub fn sanitize(
    payload: &Value,
    defaults: &GenerationParameters,
) -> GenerationParameters {
    let params = GenerationParameters {
        max_new_tokens: field(payload, &["max_new_tokens"])
            .and_then(Value::as_u64)
            .filter(|&n| n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(defaults.max_new_tokens),
        do_sample: field(payload, &["do_sample", "sample"])
            .and_then(Value::as_bool)
            .unwrap_or(defaults.do_sample),
        temperature: float_field(payload, "temperature")
            .filter(|&t| valid_temperature(t))
            .unwrap_or(defaults.temperature),
        top_p: float_field(payload, "top_p")
            .filter(|&p| valid_top_p(p))
            .unwrap_or(defaults.top_p),
    };
    if params != *defaults {
        debug!(?params, "Request overrides generation defaults.");
    }
    params
}

fn field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| payload.get(key))
}

fn float_field(payload: &Value, key: &str) -> Option<f32> {
    field(payload, &[key]).and_then(Value::as_f64).map(|v| v as f32)
}

fn valid_temperature(t: f32) -> bool {
    t.is_finite() && t > 0.0
}

fn valid_top_p(p: f32) -> bool {
    p > 0.0 && p <= 1.0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const DEFAULTS: GenerationParameters = GenerationParameters {
        max_new_tokens: 256,
        do_sample: false,
        temperature: 0.6,
        top_p: 0.9,
    };

    #[test]
    fn missing_fields_take_defaults() {
        let payload = json!({"messages": [{"role": "user", "content": "Hi"}]});
        assert_eq!(sanitize(&payload, &DEFAULTS), DEFAULTS);

        let payload = json!({"temperature": 1.2});
        let params = sanitize(&payload, &DEFAULTS);
        assert_eq!(params.temperature, 1.2);
        assert_eq!(params.max_new_tokens, DEFAULTS.max_new_tokens);
        assert_eq!(params.do_sample, DEFAULTS.do_sample);
        assert_eq!(params.top_p, DEFAULTS.top_p);
    }

    #[test]
    fn valid_values_pass_through() {
        let payload = json!({
            "max_new_tokens": 32,
            "do_sample": true,
            "temperature": 2,
            "top_p": 1.0,
        });
        assert_eq!(
            sanitize(&payload, &DEFAULTS),
            GenerationParameters {
                max_new_tokens: 32,
                do_sample: true,
                temperature: 2.0,
                top_p: 1.0,
            }
        );
    }

    #[test]
    fn wrong_types_take_defaults() {
        let payload = json!({
            "max_new_tokens": "32",
            "do_sample": "yes",
            "temperature": "hot",
            "top_p": [0.5],
        });
        assert_eq!(sanitize(&payload, &DEFAULTS), DEFAULTS);

        let payload = json!({"max_new_tokens": 12.5, "do_sample": 1, "temperature": null});
        assert_eq!(sanitize(&payload, &DEFAULTS), DEFAULTS);
    }

    #[test]
    fn out_of_range_values_take_defaults() {
        let payload = json!({
            "max_new_tokens": 0,
            "temperature": -1.0,
            "top_p": 1.5,
        });
        assert_eq!(sanitize(&payload, &DEFAULTS), DEFAULTS);

        let payload = json!({"max_new_tokens": u64::MAX, "top_p": 0});
        assert_eq!(sanitize(&payload, &DEFAULTS), DEFAULTS);
    }

    #[test]
    fn sample_is_an_alias_for_do_sample() {
        let params = sanitize(&json!({"sample": true}), &DEFAULTS);
        assert!(params.do_sample);
        let params =
            sanitize(&json!({"do_sample": false, "sample": true}), &DEFAULTS);
        assert!(!params.do_sample);
    }

    #[test]
    fn non_object_payload_is_all_defaults() {
        assert_eq!(sanitize(&json!([1, 2]), &DEFAULTS), DEFAULTS);
        assert_eq!(sanitize(&Value::Null, &DEFAULTS), DEFAULTS);
    }

    #[test]
    fn invalid_defaults_are_rejected() {
        let args = DefaultsArgs {
            default_max_new_tokens: 16,
            default_do_sample: false,
            default_temperature: 0.0,
            default_top_p: 0.9,
        };
        assert!(args.to_defaults().is_err());
        let args = DefaultsArgs { default_temperature: 0.7, ..args };
        assert_eq!(args.to_defaults().unwrap().temperature, 0.7);
    }
}
