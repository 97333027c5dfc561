//! Context preamble: the fixed instructions and scripted opening reply sent with every turn.
//!
//! The preamble is configuration, not conversation.  It never enters the transcript; the
//! transport prepends it to each request so the service answers in the assistant's voice.

use serde::{Deserialize, Serialize};
use utf8path::Path;

use crate::error::{Error, Result};

/// Supplies the immutable context for a session.
pub trait PreambleProvider: Send + Sync {
    /// The system-style instruction block.
    fn instructions(&self) -> &str;

    /// The assistant's scripted first utterance.
    fn opening_reply(&self) -> &str;

    /// Shortcut questions offered while the transcript is empty.
    fn suggested_prompts(&self) -> &[String] {
        &[]
    }
}

/// A preamble held in memory, built in or loaded from YAML.
///
/// ```yaml
/// instructions: |
///   You are the official assistant for ...
/// opening_reply: Hello! How can I help you today?
/// suggested_prompts:
///   - What do you do?
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preamble {
    instructions: String,
    opening_reply: String,
    #[serde(default)]
    suggested_prompts: Vec<String>,
}

impl Preamble {
    /// Creates a preamble without suggested prompts.
    pub fn new(instructions: impl Into<String>, opening_reply: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            opening_reply: opening_reply.into(),
            suggested_prompts: Vec::new(),
        }
    }

    /// Replaces the suggested prompts.
    pub fn with_suggested_prompts<I, S>(mut self, prompts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggested_prompts = prompts.into_iter().map(Into::into).collect();
        self
    }

    /// Parses a preamble from YAML text.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed YAML and a configuration error when the
    /// instructions or opening reply are blank.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let preamble: Self = serde_yaml::from_str(yaml)?;
        preamble.validate()?;
        Ok(preamble)
    }

    /// Loads a preamble from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_str()).map_err(|err| {
            Error::io(format!("failed to read preamble file {}", path.as_str()), err)
        })?;
        Self::from_yaml_str(&content)
    }

    /// Serializes the preamble as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.instructions.trim().is_empty() {
            return Err(Error::configuration("preamble instructions are empty"));
        }
        if self.opening_reply.trim().is_empty() {
            return Err(Error::configuration("preamble opening_reply is empty"));
        }
        if self.suggested_prompts.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::configuration("preamble has a blank suggested prompt"));
        }
        Ok(())
    }
}

impl Default for Preamble {
    /// The built-in VCNR assistant.
    fn default() -> Self {
        Preamble::new(VCNR_INSTRUCTIONS, VCNR_OPENING_REPLY)
            .with_suggested_prompts(VCNR_SUGGESTED_PROMPTS.iter().copied())
    }
}

impl PreambleProvider for Preamble {
    fn instructions(&self) -> &str {
        &self.instructions
    }

    fn opening_reply(&self) -> &str {
        &self.opening_reply
    }

    fn suggested_prompts(&self) -> &[String] {
        &self.suggested_prompts
    }
}

const VCNR_OPENING_REPLY: &str =
    "Hello! I am the official VCNR AI assistant. How can I help you today?";

const VCNR_SUGGESTED_PROMPTS: &[&str] = &[
    "What are VCNR's four core businesses?",
    "Who are some major brands you've worked with?",
    "Tell me about your tech solutions in agriculture.",
    "What makes your construction business unique?",
];

const VCNR_INSTRUCTIONS: &str = r#"You are the official AI Assistant for VCNR. Always respond clearly and professionally, using clean markdown formatting:

- **Bold** titles and labels
- Bullet points for lists
- [Links](https://example.com) for references
- No emojis or casual expressions

## LEADERSHIP
- **Chairman:** Mr. N. Narasimhamurthy V
- **CEO, VCNR Healthcare:** Mr. Vinay
- **CEO, VCNR Technologies:** Mr. Rudramurthy
- **CEO, VCNR Builders & Developers:** Mr. Santhosh

## CONTACT DETAILS
- **Phone:** 080 2951 1531 / +91 63649 14086
- **Email:** contact@vcnr.com
- **Office Address:** VCNR Towers, Nelamangala, Bengaluru
- [Google Maps Location](https://maps.app.goo.gl/wE1y1a3bThM4AADS7)

## CORE BUSINESS DETAILS

### 1. Construction (VCNR Builders & Developers)
- **Projects:** 300+ total, including 164+ warehouses
- **Clients:** 50+ across India
- **Expertise:** FM2 industrial flooring, pre-engineered buildings (PEB), roof monitors and louvers, fire hydrant systems, concrete and bitumen roads, fire alarms, sprinklers

### 2. Technology (VCNR Technologies)
- **Services:** mobile and web development, robotic process automation (RPA), AI and IoT integration, modernization of legacy applications, a custom construction measurement tool
- **Track Record:** 200+ projects, 70+ clients across 6 domains

### 3. Healthcare (VCNR Healthcare)
- **Flagship:** Karnataka's 1st Integrated Hospital
- **Centers:** 2 (Nelamangala and beyond)
- **Facilities:** health park, integrated hospital, institute of health science, laboratories, integrated pharma
- **Reach:** 10,000+ patients served

### 4. Agriculture
- **Focus:** precision agriculture using advanced technology
- **Key Solutions:** drone surveillance and sprayers, wireless sensor networks (WSN), data-driven soil and plant health monitoring
- **Impact:** 500+ acres managed, 1000+ farmers supported

## BRANDS WE'VE WORKED WITH
Nestle, Godrej, Reliance, Britannia, ITC, Denso, Flipkart, Bajaj, Safexpress, Girias, FSC, JWL, Scope Logistics

## CAREERS
VCNR offers roles in construction project management, software and AI development, healthcare administration, and agri-tech operations. To apply or inquire, reach out to [contact@vcnr.com](mailto:contact@vcnr.com).

If you do not know the answer, say only: "I'm sorry, I don't know the answer to that question. Please contact us at [contact@vcnr.com](mailto:contact@vcnr.com)."

For any detailed query, always suggest: "For more information, feel free to contact us at [contact@vcnr.com](mailto:contact@vcnr.com)."
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preamble_is_vcnr() {
        let preamble = Preamble::default();
        assert!(preamble.instructions().contains("CORE BUSINESS DETAILS"));
        assert_eq!(preamble.opening_reply(), VCNR_OPENING_REPLY);
        assert_eq!(preamble.suggested_prompts().len(), 4);
        assert_eq!(
            preamble.suggested_prompts()[0],
            "What are VCNR's four core businesses?"
        );
    }

    #[test]
    fn parse_yaml_with_default_prompts() {
        let preamble =
            Preamble::from_yaml_str("instructions: Be brief.\nopening_reply: Hi there.\n")
                .unwrap();
        assert_eq!(preamble.instructions(), "Be brief.");
        assert_eq!(preamble.opening_reply(), "Hi there.");
        assert!(preamble.suggested_prompts().is_empty());
    }

    #[test]
    fn yaml_roundtrip_keeps_prompts() {
        let preamble = Preamble::new("rules", "hello").with_suggested_prompts(["a?", "b?"]);
        let yaml = preamble.to_yaml().unwrap();
        assert_eq!(Preamble::from_yaml_str(&yaml).unwrap(), preamble);
    }

    #[test]
    fn blank_fields_are_rejected() {
        let err = Preamble::from_yaml_str("instructions: ''\nopening_reply: hi\n").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        let err = Preamble::from_yaml_str("instructions: x\nopening_reply: ' '\n").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn malformed_yaml_is_serialization_error() {
        let err = Preamble::from_yaml_str("instructions: [unclosed").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("concierge-preamble-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "instructions: File rules.\nopening_reply: From disk.\nsuggested_prompts:\n  - One?\n",
        )
        .unwrap();
        let path_str = path.to_str().unwrap().to_string();
        let preamble = Preamble::from_file(&Path::from(path_str.as_str())).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(preamble.opening_reply(), "From disk.");
        assert_eq!(preamble.suggested_prompts(), ["One?".to_string()]);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Preamble::from_file(&Path::from("/nonexistent/concierge/preamble.yaml"))
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
