//! Request validation and normalization.
//!
//! Every field is checked independently and all failures are reported
//! together, so a client sees the full list of problems in one round trip.
//! Normalization (alias copying, scalar wrapping) happens in place on the
//! request record; defaults are filled afterwards for accepted requests.

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// One turn of a multi-turn conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// A generation request as submitted by a client.
///
/// Unset fields stay `None` through deserialization; `req_id` is generated
/// when the client does not supply one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateRequest {
    #[serde(default = "default_req_id")]
    pub req_id: Option<String>,
    pub text: Option<String>,
    pub input_ids: Option<Vec<u32>>,
    pub messages: Option<Vec<Message>>,
    pub system: Option<String>,
    pub max_dec_len: Option<i64>,
    /// Legacy alias for `max_dec_len`, kept for compatibility.
    pub seq_len: Option<i64>,
    pub max_tokens: Option<i64>,
    pub min_dec_len: Option<i64>,
    pub temperature: Option<f32>,
    pub topp: Option<f32>,
    pub top_p: Option<f32>,
    pub penalty_score: Option<f32>,
    pub frequency_score: Option<f32>,
    pub presence_score: Option<f32>,
    #[serde(deserialize_with = "scalar_or_list", default)]
    pub eos_token_ids: Option<Vec<u32>>,
    pub infer_seed: Option<i64>,
    pub seed: Option<i64>,
    pub return_all_tokens: Option<bool>,
    pub stream: bool,
    pub response_type: Option<String>,
    /// Client-side deadline on the result stream, in seconds.
    pub timeout: Option<u64>,
}

fn default_req_id() -> Option<String> {
    Some(Uuid::new_v4().to_string())
}

/// Accept both a bare token id and a list of them.
fn scalar_or_list<'de, D>(deserializer: D) -> Result<Option<Vec<u32>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ScalarOrList {
        Scalar(u32),
        List(Vec<u32>),
    }

    let value = Option::<ScalarOrList>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        ScalarOrList::Scalar(id) => vec![id],
        ScalarOrList::List(ids) => ids,
    }))
}

/// Check a request and normalize its aliases in place.
///
/// Returns the full list of error messages; an empty list means the request
/// is acceptable. The checks for distinct fields are independent so one bad
/// field never masks another.
pub fn check_basic_params(req: &mut GenerateRequest) -> Vec<String> {
    let mut error_msg = Vec::new();

    let has_input =
        req.text.is_some() || req.input_ids.is_some() || req.messages.is_some();
    if !has_input {
        error_msg.push(
            "The input parameters should contain either `text`, `input_ids` or `messages`"
                .to_string(),
        );
    } else {
        if let Some(text) = &req.text {
            if text.is_empty() {
                error_msg.push("The `text` in input parameters cannot be empty".to_string());
            }
        }
        if let Some(messages) = &req.messages {
            if messages.len() % 2 == 0 {
                error_msg.push(format!(
                    "The number of the message {} must be odd",
                    messages.len()
                ));
            } else if !roles_alternate(messages) {
                error_msg.push(
                    "The `messages` roles must alternate between `user` and `assistant` \
                     and end with `user`"
                        .to_string(),
                );
            }
            if !messages.iter().all(|m| m.content.is_some()) {
                error_msg.push("The item in messages must include `content`".to_string());
            }
        }
    }

    if req.req_id.is_none() {
        error_msg.push("The input parameters should contain `req_id`.".to_string());
    }

    if let Some(min_dec_len) = req.min_dec_len {
        if min_dec_len < 1 {
            error_msg
                .push("The `min_dec_len` must be an integer and greater than 0".to_string());
        }
    }

    for (name, value) in [
        ("max_dec_len", req.max_dec_len),
        ("seq_len", req.seq_len),
        ("max_tokens", req.max_tokens),
    ] {
        if let Some(v) = value {
            if v < 1 {
                error_msg.push(format!("The `{}` must be an integer and greater than 0", name));
            }
        }
    }
    if req.max_dec_len.is_none() {
        if let Some(v) = req.seq_len {
            req.max_dec_len = Some(v);
        } else if let Some(v) = req.max_tokens {
            req.max_dec_len = Some(v);
        }
    }

    if req.topp.is_some() && req.top_p.is_some() {
        error_msg.push("Only one of `topp` and `top_p` should be set".to_string());
    } else {
        for (name, value) in [("topp", req.topp), ("top_p", req.top_p)] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    error_msg.push(format!("The `{}` must be in [0, 1]", name));
                }
            }
        }
        if req.topp.is_none() {
            if let Some(v) = req.top_p {
                req.topp = Some(v);
            }
        }
    }

    if let Some(temperature) = req.temperature {
        if temperature < 0.0 {
            error_msg.push("The `temperature` must be >= 0".to_string());
        }
    }

    if let Some(eos_token_ids) = &req.eos_token_ids {
        if eos_token_ids.len() != 1 {
            error_msg
                .push("The length of `eos_token_ids` must be 1 if you set it".to_string());
        }
    }

    if req.infer_seed.is_some() && req.seed.is_some() {
        error_msg.push("Only one of `infer_seed` and `seed` should be set".to_string());
    } else if req.infer_seed.is_none() {
        if let Some(seed) = req.seed {
            req.infer_seed = Some(seed);
        }
    }

    if let Some(response_type) = &req.response_type {
        let lowered = response_type.to_lowercase();
        if lowered != "fastdeploy" && lowered != "openai" {
            error_msg.push(
                "The `response_type` must be either `fastdeploy` or `openai`.".to_string(),
            );
        }
    }

    error_msg
}

fn roles_alternate(messages: &[Message]) -> bool {
    messages.iter().enumerate().all(|(i, m)| {
        if i % 2 == 0 {
            m.role == "user"
        } else {
            m.role == "assistant"
        }
    })
}

/// Fill defaults for accepted requests. Kept in sync with the sampling
/// defaults the executor assumes.
pub fn add_default_params(req: &mut GenerateRequest) {
    if req.min_dec_len.is_none() {
        req.min_dec_len = Some(1);
    }
    if req.topp.is_none() {
        req.topp = Some(0.7);
    }
    if req.temperature.is_none() {
        req.temperature = Some(0.95);
    }
    if req.penalty_score.is_none() {
        req.penalty_score = Some(1.0);
    }
    if req.frequency_score.is_none() {
        req.frequency_score = Some(0.0);
    }
    if req.presence_score.is_none() {
        req.presence_score = Some(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> GenerateRequest {
        serde_json::from_str(json).expect("request json")
    }

    #[test]
    fn aliases_are_normalized_and_defaults_filled() {
        let mut req = parse(r#"{"text": "hello", "top_p": 0.9, "seed": 42, "max_tokens": 50}"#);
        let errors = check_basic_params(&mut req);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        add_default_params(&mut req);

        assert_eq!(req.topp, Some(0.9));
        assert_eq!(req.infer_seed, Some(42));
        assert_eq!(req.max_dec_len, Some(50));
        assert_eq!(req.temperature, Some(0.95));
        assert_eq!(req.min_dec_len, Some(1));
        assert!(req.req_id.is_some());
    }

    #[test]
    fn seq_len_wins_over_max_tokens() {
        let mut req = parse(r#"{"text": "hi", "seq_len": 7, "max_tokens": 9}"#);
        assert!(check_basic_params(&mut req).is_empty());
        assert_eq!(req.max_dec_len, Some(7));
    }

    #[test]
    fn all_errors_are_reported_together() {
        let mut req = parse(
            r#"{
                "text": "",
                "top_p": 1.5,
                "messages": [
                    {"role": "user", "content": "a"},
                    {"role": "assistant", "content": "b"}
                ]
            }"#,
        );
        let errors = check_basic_params(&mut req);
        assert_eq!(errors.len(), 3, "errors: {:?}", errors);
        assert!(errors[0].contains("`text`"));
        assert!(errors[1].contains("must be odd"));
        assert!(errors[2].contains("`top_p`"));
    }

    #[test]
    fn missing_input_source_is_an_error() {
        let mut req = parse(r#"{"req_id": "r1"}"#);
        let errors = check_basic_params(&mut req);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("either `text`, `input_ids` or `messages`"));
    }

    #[test]
    fn scalar_eos_token_is_wrapped() {
        let mut req = parse(r#"{"text": "hi", "eos_token_ids": 7}"#);
        assert!(check_basic_params(&mut req).is_empty());
        assert_eq!(req.eos_token_ids, Some(vec![7]));
    }

    #[test]
    fn eos_token_list_must_have_one_entry() {
        let mut req = parse(r#"{"text": "hi", "eos_token_ids": [7, 8]}"#);
        let errors = check_basic_params(&mut req);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("eos_token_ids"));
    }

    #[test]
    fn conflicting_seeds_are_rejected() {
        let mut req = parse(r#"{"text": "hi", "seed": 1, "infer_seed": 2}"#);
        let errors = check_basic_params(&mut req);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("infer_seed"));
    }

    #[test]
    fn message_roles_must_alternate() {
        let mut req = parse(
            r#"{"messages": [
                {"role": "assistant", "content": "a"},
                {"role": "user", "content": "b"},
                {"role": "user", "content": "c"}
            ]}"#,
        );
        let errors = check_basic_params(&mut req);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("alternate"));
    }

    #[test]
    fn response_type_is_case_insensitive() {
        let mut req = parse(r#"{"text": "hi", "response_type": "OpenAI"}"#);
        assert!(check_basic_params(&mut req).is_empty());

        let mut req = parse(r#"{"text": "hi", "response_type": "grpc"}"#);
        assert_eq!(check_basic_params(&mut req).len(), 1);
    }
}
