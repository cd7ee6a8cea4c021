//! Records exchanged with collaborator services.
//!
//! Money is always integer cents here; conversion to yuan happens only in API projections.

mod auth;
mod order;
mod setting;
mod user;
mod vps;
mod wallet;

pub use auth::{
    Captcha, Channel, CodeComplexity, CodePolicy, ContactKind, GeoLocation, RegisterInput,
    Ticket, TicketPurpose, TotpSetup,
};
pub use order::{
    CouponPreview, ItemAction, NotifyOutcome, NotifyRequest, NotifyResult, Order, OrderDetail,
    OrderEvent, OrderFilter, OrderItem, OrderItemInput, OrderPayment, OrderSource, OrderStatus,
    PaymentInput, PaymentSelectInput, PaymentSelectResult, PaymentStatus, RefundResult,
    RenewInput, ResizeInput, ResizeQuote,
};
pub use setting::Setting;
pub use user::{Permission, User, UserRole, UserStatus};
pub use vps::VpsInstance;
pub use wallet::{
    PaymentMethod, ProviderPaymentInput, Wallet, WalletOrder, WalletOrderInput,
    WalletOrderStatus, WalletOrderType,
};

/// Default currency for orders and wallet movements.
pub const DEFAULT_CURRENCY: &str = "CNY";
