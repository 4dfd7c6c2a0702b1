use uuid::Uuid;
use super::value_objects::VendorStatus;

// ============================================================================
// Order Commands - state changes requested on an existing order
// ============================================================================
//
// Order creation is not a command here: it has no prior state to lock and is
// handled by OrderCommandHandler::create_order directly.
//

#[derive(Debug, Clone, PartialEq)]
pub enum OrderCommand {
    MarkVendorStatus {
        vendor_id: Uuid,
        status: VendorStatus,
    },
    AttachPaymentReference {
        reference: String,
    },
    CapturePayment,
    FailPayment {
        reason: Option<String>,
    },
}

impl OrderCommand {
    /// Label used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            OrderCommand::MarkVendorStatus { .. } => "mark_vendor_status",
            OrderCommand::AttachPaymentReference { .. } => "attach_payment_reference",
            OrderCommand::CapturePayment => "mark_payment_captured",
            OrderCommand::FailPayment { .. } => "mark_payment_failed",
        }
    }
}
