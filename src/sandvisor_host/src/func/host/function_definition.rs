use crate::error::SandboxError;
use crate::func::types::{ParameterType, ReturnType};
use crate::Result;

/// The name, parameter types and return type of a function the host has
/// exposed to the guest.
///
/// Wire layout: `[u32 total_len][name: len-prefixed utf8][u8 has_params]`
/// followed, when `has_params` is nonzero, by `[u32 param_count][tag...]`,
/// and finally `[u8 return_type_tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFunctionDefinition {
    pub(crate) function_name: String,
    pub(crate) parameter_types: Option<Vec<ParameterType>>,
    pub(crate) return_type: ReturnType,
}

impl HostFunctionDefinition {
    pub(crate) fn new(
        function_name: String,
        parameter_types: Option<Vec<ParameterType>>,
        return_type: ReturnType,
    ) -> Self {
        Self {
            function_name,
            parameter_types,
            return_type,
        }
    }
}

impl PartialOrd for HostFunctionDefinition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HostFunctionDefinition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.function_name.cmp(&other.function_name)
    }
}

impl TryFrom<&HostFunctionDefinition> for Vec<u8> {
    type Error = SandboxError;
    fn try_from(value: &HostFunctionDefinition) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let name_bytes = value.function_name.as_bytes();
        body.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
        body.extend_from_slice(name_bytes);

        match &value.parameter_types {
            Some(params) => {
                body.push(1);
                body.extend_from_slice(&(params.len() as u32).to_le_bytes());
                for param in params {
                    body.push(u8::from(*param));
                }
            }
            None => body.push(0),
        }
        body.push(u8::from(value.return_type));

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

impl TryFrom<&[u8]> for HostFunctionDefinition {
    type Error = SandboxError;
    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() < 4 {
            return Err(crate::new_error!("host function definition buffer is too short"));
        }
        let total_len = u32::from_le_bytes(value[0..4].try_into()?) as usize;
        if value.len() < 4 + total_len {
            return Err(crate::new_error!(
                "host function definition buffer declares length {} but only {} bytes are available",
                total_len,
                value.len().saturating_sub(4)
            ));
        }
        let body = &value[4..4 + total_len];
        let name_len = u32::from_le_bytes(body[0..4].try_into()?) as usize;
        let mut cursor = 4 + name_len;
        let function_name = String::from_utf8_lossy(&body[4..cursor]).into_owned();

        let has_params = *body
            .get(cursor)
            .ok_or_else(|| crate::new_error!("host function definition buffer truncated"))?;
        cursor += 1;
        let parameter_types = if has_params != 0 {
            let count = u32::from_le_bytes(body[cursor..cursor + 4].try_into()?) as usize;
            cursor += 4;
            let mut types = Vec::with_capacity(count);
            for _ in 0..count {
                types.push(ParameterType::try_from(body[cursor])?);
                cursor += 1;
            }
            Some(types)
        } else {
            None
        };
        let return_type = ReturnType::try_from(body[cursor])?;

        Ok(HostFunctionDefinition {
            function_name,
            parameter_types,
            return_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let def = HostFunctionDefinition::new(
            "HostPrint".to_string(),
            Some(vec![ParameterType::String]),
            ReturnType::Int,
        );
        let bytes = Vec::<u8>::try_from(&def).unwrap();
        let decoded = HostFunctionDefinition::try_from(bytes.as_slice()).unwrap();
        assert_eq!(def, decoded);
    }

    #[test]
    fn round_trip_no_params() {
        let def = HostFunctionDefinition::new("Ping".to_string(), None, ReturnType::Void);
        let bytes = Vec::<u8>::try_from(&def).unwrap();
        let decoded = HostFunctionDefinition::try_from(bytes.as_slice()).unwrap();
        assert_eq!(def, decoded);
    }
}
