use crate::domain::payment::ProviderCallback;
use crate::error::Result;
use serde::Deserialize;
use std::io::Read;

/// The provider's webhook payload, as delivered: a nested envelope with a
/// metadata item list. Mapped into the flat internal `ProviderCallback`
/// before reconciliation ever sees it.
#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata")]
    pub metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Option<serde_json::Value>,
}

impl CallbackEnvelope {
    /// Parses the raw webhook body from any `Read` source.
    pub fn from_reader<R: Read>(source: R) -> Result<Self> {
        Ok(serde_json::from_reader(source)?)
    }

    pub fn into_callback(self) -> ProviderCallback {
        let callback = self.body.stk_callback;
        let receipt_id = callback.metadata.as_ref().and_then(|metadata| {
            metadata
                .items
                .iter()
                .find(|item| item.name == "MpesaReceiptNumber")
                .and_then(|item| item.value.as_ref())
                .and_then(|value| value.as_str())
                .map(str::to_string)
        });
        ProviderCallback {
            correlation_id: callback.checkout_request_id,
            result_code: callback.result_code,
            result_desc: callback.result_desc,
            receipt_id,
        }
    }
}
