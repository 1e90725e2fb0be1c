//! Parcels: a payment transaction bundled with the payload it pays for.

use serde::{Deserialize, Serialize};

use super::{ItemId, Transaction};
use crate::error::ItemError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    id: ItemId,
    payment: Transaction,
    payload: Transaction,
}

#[derive(Serialize, Deserialize)]
struct PackedParcel {
    payment: Vec<u8>,
    payload: Vec<u8>,
}

impl Parcel {
    pub fn new(payment: Transaction, payload: Transaction) -> Result<Self, ItemError> {
        if payment.root_id() == payload.root_id() {
            return Err(ItemError::Structure("payment and payload are the same item".into()));
        }
        let id = ItemId::digest(&Self::encode(&payment, &payload)?);
        Ok(Self { id, payment, payload })
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn payment(&self) -> &Transaction {
        &self.payment
    }

    pub fn payload(&self) -> &Transaction {
        &self.payload
    }

    pub fn pack(&self) -> Result<Vec<u8>, ItemError> {
        Self::encode(&self.payment, &self.payload)
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, ItemError> {
        let packed: PackedParcel = rmp_serde::from_slice(bytes)?;
        let parcel = Self::new(
            Transaction::unpack(&packed.payment)?,
            Transaction::unpack(&packed.payload)?,
        )?;
        let actual = ItemId::digest(bytes);
        if parcel.id != actual {
            return Err(ItemError::HashMismatch {
                expected: parcel.id,
                actual,
            });
        }
        Ok(parcel)
    }

    fn encode(payment: &Transaction, payload: &Transaction) -> Result<Vec<u8>, ItemError> {
        let packed = PackedParcel {
            payment: payment.pack()?,
            payload: payload.pack()?,
        };
        Ok(rmp_serde::to_vec_named(&packed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use chrono::{Duration, Utc};

    fn tx(body: &str) -> Transaction {
        let now = Utc::now();
        Transaction::single(Item::new(body.as_bytes(), now, now + Duration::hours(1))).unwrap()
    }

    #[test]
    fn test_parcel_roundtrip_keeps_id() {
        let parcel = Parcel::new(tx("payment"), tx("payload")).unwrap();
        let restored = Parcel::unpack(&parcel.pack().unwrap()).unwrap();
        assert_eq!(restored.id(), parcel.id());
        assert_eq!(restored.payload().root_id(), parcel.payload().root_id());
    }

    #[test]
    fn test_parcel_rejects_identical_parts() {
        let t = tx("same");
        assert!(Parcel::new(t.clone(), t).is_err());
    }
}
