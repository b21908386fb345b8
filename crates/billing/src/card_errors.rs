//! Card decline translation
//!
//! Decline codes come back from the provider (server side) or from the
//! client SDK (poller side). Both are mapped to the same short, actionable
//! messages shown to the member.

/// Translate a provider decline code into a user-facing message
pub fn card_error_message(code: &str) -> &'static str {
    match code.trim().to_lowercase().as_str() {
        "insufficient_funds" => "Your card has insufficient funds. Please use a different card.",
        "expired_card" => "Your card has expired. Please update your card details.",
        "incorrect_cvc" | "invalid_cvc" => {
            "The security code (CVC) is incorrect. Please check and try again."
        }
        "incorrect_number" | "invalid_number" => {
            "The card number is incorrect. Please check and try again."
        }
        "incorrect_zip" => "The postal code does not match your card. Please check and try again.",
        "lost_card" | "stolen_card" | "pickup_card" => {
            "Your card was declined. Please contact your bank or use a different card."
        }
        "processing_error" => "An error occurred while processing your card. Please try again.",
        "authentication_required" | "payment_intent_authentication_failure" => {
            "Your bank requires additional authentication. Please try again and complete verification."
        }
        "card_velocity_exceeded" | "withdrawal_count_limit_exceeded" => {
            "Your card has exceeded its spending limit. Please use a different card."
        }
        "do_not_honor" | "generic_decline" | "card_declined" => {
            "Your card was declined. Please use a different card."
        }
        _ => "Your payment could not be completed. Please check your card details and try again.",
    }
}

/// Whether a decline code means the member must change payment details
/// (as opposed to a provider hiccup that may succeed on resubmission)
pub fn requires_new_payment_method(code: &str) -> bool {
    !matches!(
        code.trim().to_lowercase().as_str(),
        "processing_error" | "authentication_required" | "payment_intent_authentication_failure"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_are_translated() {
        assert!(card_error_message("insufficient_funds").contains("insufficient funds"));
        assert!(card_error_message("EXPIRED_CARD").contains("expired"));
        assert!(card_error_message("stolen_card").contains("contact your bank"));
    }

    #[test]
    fn test_unknown_code_falls_back() {
        assert!(card_error_message("something_new").contains("could not be completed"));
    }

    #[test]
    fn test_new_payment_method_classification() {
        assert!(requires_new_payment_method("insufficient_funds"));
        assert!(!requires_new_payment_method("processing_error"));
    }
}
