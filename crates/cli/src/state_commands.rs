use {
    agentgate_protocol::{AgentId, AgentState, AgentStateData, Blob, GetStateResponse, SaveStateResponse},
    anyhow::{Context, Result, bail},
    base64::Engine,
    clap::Subcommand,
};

const DEFAULT_URL: &str = "http://127.0.0.1:18790";

#[derive(Subcommand)]
pub enum StateAction {
    /// Fetch the stored state of an agent.
    Get {
        agent_type: String,
        key: String,
        /// Gateway base URL.
        #[arg(long, env = "AGENTGATE_URL", default_value = DEFAULT_URL)]
        url: String,
    },
    /// Save agent state. Pass the current eTag to update, none to create.
    Save {
        agent_type: String,
        key: String,
        #[arg(long, default_value = "")]
        etag: String,
        #[arg(long, conflicts_with_all = ["json", "base64"])]
        text: Option<String>,
        #[arg(long, conflicts_with = "base64")]
        json: Option<String>,
        #[arg(long)]
        base64: Option<String>,
        /// Gateway base URL.
        #[arg(long, env = "AGENTGATE_URL", default_value = DEFAULT_URL)]
        url: String,
    },
}

pub async fn handle_state(action: StateAction) -> Result<()> {
    let client = reqwest::Client::new();
    match action {
        StateAction::Get {
            agent_type,
            key,
            url,
        } => {
            let resp: GetStateResponse = client
                .post(format!("{}/state/get", url.trim_end_matches('/')))
                .json(&AgentId::new(agent_type, key))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            match resp.agent_state {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => bail!(resp.error.unwrap_or_else(|| "state not found".into())),
            }
            Ok(())
        },
        StateAction::Save {
            agent_type,
            key,
            etag,
            text,
            json,
            base64,
            url,
        } => {
            let state = AgentState {
                agent_id: AgentId::new(agent_type, key),
                etag,
                data: state_data(text, json, base64)?,
            };
            let resp: SaveStateResponse = client
                .post(format!("{}/state/save", url.trim_end_matches('/')))
                .json(&state)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if !resp.success {
                bail!(
                    "{} ({})",
                    resp.error.unwrap_or_default(),
                    resp.error_code.unwrap_or_default()
                );
            }
            println!("{}", resp.etag.unwrap_or_default());
            Ok(())
        },
    }
}

fn state_data(
    text: Option<String>,
    json: Option<String>,
    base64: Option<String>,
) -> Result<AgentStateData> {
    match (text, json, base64) {
        (Some(text), None, None) => Ok(AgentStateData::Text(text)),
        (None, Some(json), None) => Ok(AgentStateData::Structured(
            serde_json::from_str(&json).context("--json is not valid JSON")?,
        )),
        (None, None, Some(encoded)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .context("--base64 is not valid base64")?;
            Ok(AgentStateData::Binary(Blob(bytes)))
        },
        _ => bail!("exactly one of --text, --json or --base64 is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_data() {
        let data = state_data(Some("hi".into()), None, None).unwrap();
        assert_eq!(data, AgentStateData::Text("hi".into()));
    }

    #[test]
    fn json_data_must_parse() {
        let data = state_data(None, Some(r#"{"n":1}"#.into()), None).unwrap();
        assert_eq!(data, AgentStateData::Structured(serde_json::json!({ "n": 1 })));
        assert!(state_data(None, Some("{".into()), None).is_err());
    }

    #[test]
    fn base64_data_decodes() {
        let data = state_data(None, None, Some("AAEC".into())).unwrap();
        assert_eq!(data, AgentStateData::Binary(Blob(vec![0, 1, 2])));
    }

    #[test]
    fn missing_data_is_an_error() {
        assert!(state_data(None, None, None).is_err());
    }
}
