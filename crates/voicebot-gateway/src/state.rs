//! Gateway shared state.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use voicebot_core::config::Config;
use voicebot_core::error::Result;
use voicebot_core::registry::SessionRegistry;
use voicebot_media::convert::{self, AudioFormatConverter};
use voicebot_media::tts::{self, TextToSpeech};

use crate::calls::{CallInitiator, ExotelCaller};
use crate::greeting::GreetingPipeline;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub greeting: Arc<GreetingPipeline>,
    pub caller: Option<Arc<dyn CallInitiator>>,
    pub ws_token: Option<String>,
    pub started_at: Instant,
}

impl GatewayState {
    /// Assemble state around explicit collaborators.
    pub fn new(
        config: Arc<Config>,
        tts: Arc<dyn TextToSpeech>,
        converter: Arc<dyn AudioFormatConverter>,
    ) -> Self {
        let greeting = Arc::new(GreetingPipeline::new(tts, converter, config.greeting()));
        let ws_token = config.ws_token();
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            greeting,
            caller: None,
            ws_token,
            started_at: Instant::now(),
        }
    }

    /// Build collaborators from config.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let tts = tts::from_config(&config.tts())?;
        let converter = convert::from_config(&config.converter())?;

        let caller: Option<Arc<dyn CallInitiator>> = match &config.telephony {
            Some(telephony) => match ExotelCaller::from_config(telephony) {
                Ok(caller) => Some(Arc::new(caller)),
                Err(e) => {
                    warn!(error = %e, "Outbound calling disabled");
                    None
                }
            },
            None => None,
        };

        let state = Self::new(config, tts, converter).with_caller(caller);
        info!(
            tts = %state.config.tts().provider,
            converter = %state.config.converter().kind,
            calls = state.caller.is_some(),
            auth = state.ws_token.is_some(),
            "Gateway state initialized"
        );
        Ok(state)
    }

    pub fn with_caller(mut self, caller: Option<Arc<dyn CallInitiator>>) -> Self {
        self.caller = caller;
        self
    }
}
