//! TypedTask trait - 型付き Task の定義
//!
//! task_type の文字列と payload の型を対応付ける。payload は JSON で運ぶ。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A task whose payload is a serde type bound to a fixed task type.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl TypedTask for SendEmail {
///     const TYPE: &'static str = "send_email";
/// }
/// ```
pub trait TypedTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::TypedTask;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SendEmail {
        pub to: String,
    }

    impl TypedTask for SendEmail {
        const TYPE: &'static str = "send_email";
    }
}
