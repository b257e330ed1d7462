#[cfg(feature = "provider-ideogram")]
pub mod ideogram;
#[cfg(feature = "provider-stripe")]
pub mod stripe;

#[cfg(feature = "provider-ideogram")]
pub use ideogram::IdeogramClient;
#[cfg(feature = "provider-stripe")]
pub use stripe::{CheckoutSession, StripeClient};
