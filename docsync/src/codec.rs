//! Typed views over documents.

use docsync_core::{CodecError, Document};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts between a typed value and its document form.
pub trait DocumentCodec<T> {
    fn encode(&self, value: &T) -> Result<Document, CodecError>;
    fn decode(&self, document: &Document) -> Result<T, CodecError>;
}

/// Codec for any serde type whose serialized form is a map.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeCodec;

impl<T> DocumentCodec<T> for SerdeCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Document, CodecError> {
        let type_name = std::any::type_name::<T>();
        let value = serde_json::to_value(value).map_err(|e| CodecError::Encode {
            type_name,
            reason: e.to_string(),
        })?;
        Document::from_value(value).ok_or(CodecError::NotAnObject { type_name })
    }

    fn decode(&self, document: &Document) -> Result<T, CodecError> {
        serde_json::from_value(document.clone().into_value()).map_err(|e| CodecError::Decode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ServerSettings {
        max_players: u32,
        #[serde(default)]
        motd: Option<String>,
    }

    #[test]
    fn test_encodes_struct_as_document() {
        let settings = ServerSettings {
            max_players: 100,
            motd: None,
        };
        let document = SerdeCodec.encode(&settings).unwrap();
        assert_eq!(document.get("maxPlayers").unwrap(), 100);

        let decoded: ServerSettings = SerdeCodec.decode(&document).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn test_scalar_is_not_a_document() {
        let result = SerdeCodec.encode(&42u32);
        assert!(matches!(result, Err(CodecError::NotAnObject { .. })));
    }

    #[test]
    fn test_decode_reports_type_name() {
        let document = Document::new().with("maxPlayers", "lots");
        let result: Result<ServerSettings, _> = SerdeCodec.decode(&document);
        match result {
            Err(CodecError::Decode { type_name, .. }) => {
                assert!(type_name.ends_with("ServerSettings"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
