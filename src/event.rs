use serde::Serialize;

/// A domain event that can be routed to local listeners and, when
/// registered, recorded in the outbox.
///
/// `EVENT_TYPE` is the stable tag stored in the `event_type` column and used
/// as the local listener channel. It must be unique per event type.
///
/// ```ignore
/// #[derive(Serialize)]
/// struct OrderPaid { order_id: u64 }
///
/// impl DomainEvent for OrderPaid {
///     const EVENT_TYPE: &'static str = "OrderPaid";
/// }
/// ```
pub trait DomainEvent: Serialize + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;

    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }
}
