use crate::error::{SpeakError, SpeakResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server method that switches the connection to binary framing
pub const STREAM_METHOD: &str = "stream-binary";

/// Parameters of a streaming synthesis request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Text to speak
    pub text: String,
    /// Model identifier understood by the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Reference voice sample path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Speech speed multiplier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    id: String,
    method: &'a str,
    params: &'a SynthesisRequest,
}

impl SynthesisRequest {
    /// Create a request for `text` with server defaults for everything else
    #[must_use]
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            model: None,
            voice: None,
            speed: None,
            temperature: None,
        }
    }

    /// Set the model
    #[must_use]
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the reference voice
    #[must_use]
    pub fn with_voice<S: Into<String>>(mut self, voice: S) -> Self {
        self.voice = Some(voice.into());
        self
    }

    /// Set the speed multiplier
    #[must_use]
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Validate request parameters
    ///
    /// # Errors
    ///
    /// Returns an error if the text is blank or a numeric parameter is not
    /// a positive finite number.
    pub fn validate(&self) -> SpeakResult<()> {
        if self.text.trim().is_empty() {
            return Err(SpeakError::invalid_input("Text cannot be empty"));
        }

        if let Some(speed) = self.speed {
            if !speed.is_finite() || speed <= 0.0 {
                return Err(SpeakError::invalid_input(format!(
                    "Speed must be positive, got {speed}"
                )));
            }
        }

        if let Some(temperature) = self.temperature {
            if !temperature.is_finite() || temperature < 0.0 {
                return Err(SpeakError::invalid_input(format!(
                    "Temperature must be non-negative, got {temperature}"
                )));
            }
        }

        Ok(())
    }

    /// Serialize as a newline-terminated JSON request line with a fresh id
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_line(&self) -> SpeakResult<String> {
        let envelope = RequestEnvelope {
            id: Uuid::new_v4().to_string(),
            method: STREAM_METHOD,
            params: self,
        };
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        Ok(line)
    }
}
