//! Tag lifecycle: scans, owner verification against subscription coverage,
//! replacement, batch creation and export bookkeeping.

use std::collections::HashSet;

use chrono::Utc;
use rand::{Rng, distr::Alphanumeric};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gateway::{Email, EmailTemplate, MessageReceipt, dispatch_email};
use crate::store::Store;
use crate::subscription;
use crate::types::{
    AppState, Assignment, CapOutcome, MAX_VERIFIED_PER_SUBSCRIPTION, Pet, QrCode, QrStatus,
    Subscription, User,
};

pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_EXPORT_SIZE: i64 = 5000;
pub const MAX_CONTACT_MESSAGE_LEN: usize = 500;
const CODE_PREFIX: &str = "PT-";
const CODE_LEN: usize = 8;

/// Where a scan should send the visitor.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScanOutcome {
    PublicProfile {
        qr_code: String,
        pet_id: Uuid,
        redirect_url: String,
    },
    NeedsVerification {
        qr_code: String,
        reason: VerificationReason,
        redirect_url: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationReason {
    Unassigned,
    NotVerified,
    CoverageExpired,
    PetMissing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// Coverage was applied to the tag.
    Verified {
        qr: QrCode,
        subscription_id: Uuid,
        verified_count: i64,
        max: i64,
    },
    AlreadyVerified { qr: QrCode },
    /// No active coverage; the owner has to pay before the tag is verified.
    PaymentRequired { qr: QrCode },
}

#[derive(Debug, Clone, Serialize)]
pub struct Replacement {
    pub revoked: Option<QrCode>,
    pub issued: QrCode,
}

/// Records a scan of `code` and decides where to send the visitor.
pub async fn scan(store: &dyn Store, public_base_url: &str, code: &str) -> Result<ScanOutcome> {
    let qr = store
        .record_scan(code, Utc::now())
        .await?
        .ok_or(Error::NotFound("QR code"))?;

    let needs_verification = |reason| ScanOutcome::NeedsVerification {
        qr_code: qr.code.clone(),
        reason,
        redirect_url: format!("{public_base_url}/verify/{}", qr.code),
    };

    let Some(owner) = qr.assigned_user_id.filter(|_| qr.status != QrStatus::Unassigned) else {
        return Ok(needs_verification(VerificationReason::Unassigned));
    };
    if !qr.is_verified() {
        return Ok(needs_verification(VerificationReason::NotVerified));
    }

    let now = Utc::now();
    let coverage = match store.find_covering_by_qr(qr.id, owner, now).await? {
        Some(sub) => Some(sub),
        None => store.find_covering_by_user(owner, now).await?,
    };
    if coverage.is_none() {
        return Ok(needs_verification(VerificationReason::CoverageExpired));
    }

    match resolve_pet(store, &qr, owner).await? {
        Some(pet) => Ok(ScanOutcome::PublicProfile {
            qr_code: qr.code.clone(),
            pet_id: pet.id,
            redirect_url: format!("{public_base_url}/pet/{}", pet.id),
        }),
        None => {
            warn!(qr_code = %qr.code, user_id = %owner, "verified tag without a pet");
            Ok(needs_verification(VerificationReason::PetMissing))
        }
    }
}

async fn resolve_pet(store: &dyn Store, qr: &QrCode, owner: Uuid) -> Result<Option<Pet>> {
    if let Some(pet_id) = qr.assigned_pet_id {
        if let Some(pet) = store.get_pet(pet_id).await? {
            return Ok(Some(pet));
        }
    }
    if let Some(order_id) = qr.assigned_order_id {
        if let Some(pet) = store.find_pet_by_order(order_id).await? {
            return Ok(Some(pet));
        }
    }
    Ok(store.list_pets_for_user(owner).await?.into_iter().next())
}

/// Binds the tag to `user_id` if needed and applies existing coverage.
///
/// Without coverage the tag stays assigned and the caller has to collect
/// a payment first.
pub async fn verify_or_auto_verify(
    state: &AppState,
    user_id: Uuid,
    qr_code_id: Uuid,
    pet_id: Option<Uuid>,
) -> Result<VerifyOutcome> {
    let store = state.store.as_ref();
    let user = store
        .get_user(user_id)
        .await?
        .ok_or(Error::NotFound("user"))?;
    let mut qr = store
        .get_qr(qr_code_id)
        .await?
        .ok_or(Error::NotFound("QR code"))?;

    if qr.assigned_user_id.is_some_and(|owner| owner != user_id) {
        return Err(Error::AlreadyAssigned);
    }
    if matches!(qr.status, QrStatus::Lost | QrStatus::Revoked) {
        return Err(Error::InvalidState(format!(
            "QR code {} can no longer be verified",
            qr.code
        )));
    }
    if qr.is_verified() {
        return Ok(VerifyOutcome::AlreadyVerified { qr });
    }

    let coverage = subscription::active_coverage(store, user_id).await?;
    if coverage.is_some() {
        let current = store.count_verified_for_user(user_id).await?;
        if current >= MAX_VERIFIED_PER_SUBSCRIPTION {
            return Err(Error::LimitExceeded {
                current,
                max: MAX_VERIFIED_PER_SUBSCRIPTION,
            });
        }
    }

    if qr.status == QrStatus::Unassigned {
        qr = auto_assign(store, &qr, user_id, pet_id).await?;
    }

    match coverage {
        Some(sub) => apply_coverage(state, &user, qr.id, &sub).await,
        None => Ok(VerifyOutcome::PaymentRequired { qr }),
    }
}

async fn auto_assign(
    store: &dyn Store,
    qr: &QrCode,
    user_id: Uuid,
    pet_id: Option<Uuid>,
) -> Result<QrCode> {
    let pet = pick_unlinked_pet(store, user_id, pet_id).await?;
    let assignment = Assignment {
        user_id,
        pet_id: pet.as_ref().map(|p| p.id),
        order_id: pet.as_ref().and_then(|p| p.user_pet_tag_order_id),
    };

    match store.assign_if_unassigned(qr.id, assignment).await? {
        Some(assigned) => {
            info!(qr_code = %assigned.code, %user_id, pet_id = ?assignment.pet_id, "assigned QR code");
            Ok(assigned)
        }
        None => {
            let fresh = store
                .get_qr(qr.id)
                .await?
                .ok_or(Error::NotFound("QR code"))?;
            if fresh.assigned_user_id == Some(user_id) {
                Ok(fresh)
            } else {
                Err(Error::AlreadyAssigned)
            }
        }
    }
}

/// The requested pet if it has no tag yet, else the user's first pet without one.
async fn pick_unlinked_pet(
    store: &dyn Store,
    user_id: Uuid,
    requested: Option<Uuid>,
) -> Result<Option<Pet>> {
    let mut unlinked = Vec::new();
    for pet in store.list_pets_for_user(user_id).await? {
        if store.find_qr_for_pet(pet.id).await?.is_none() {
            unlinked.push(pet);
        }
    }

    if let Some(wanted) = requested {
        if let Some(pos) = unlinked.iter().position(|p| p.id == wanted) {
            return Ok(Some(unlinked.swap_remove(pos)));
        }
    }
    Ok(unlinked.into_iter().next())
}

/// Flips the tag to verified under the coverage cap.
pub(crate) async fn apply_coverage(
    state: &AppState,
    user: &User,
    qr_code_id: Uuid,
    subscription: &Subscription,
) -> Result<VerifyOutcome> {
    let outcome = state
        .store
        .verify_within_cap(qr_code_id, user.id, MAX_VERIFIED_PER_SUBSCRIPTION)
        .await?;

    match outcome {
        CapOutcome::Verified { qr, verified_count } => {
            info!(
                qr_code = %qr.code,
                user_id = %user.id,
                subscription_id = %subscription.id,
                verified_count,
                "verified QR code"
            );
            dispatch_email(
                state.mailer.clone(),
                Email {
                    template: EmailTemplate::QrVerified,
                    to: user.email.clone(),
                    variables: json!({
                        "name": user.full_name,
                        "qr_code": qr.code,
                        "verified_count": verified_count,
                    }),
                },
            );
            Ok(VerifyOutcome::Verified {
                qr,
                subscription_id: subscription.id,
                verified_count,
                max: MAX_VERIFIED_PER_SUBSCRIPTION,
            })
        }
        CapOutcome::LimitExceeded { current } => Err(Error::LimitExceeded {
            current,
            max: MAX_VERIFIED_PER_SUBSCRIPTION,
        }),
    }
}

/// Moves a pet onto a fresh tag and clears the one it had.
///
/// The new tag is only assigned; the owner verifies it again.
pub async fn revoke_and_replace(
    store: &dyn Store,
    pet_id: Uuid,
    new_order_id: Uuid,
) -> Result<Replacement> {
    let pet = store.get_pet(pet_id).await?.ok_or(Error::NotFound("pet"))?;
    let old = store.find_qr_for_pet(pet.id).await?;

    let issued = store
        .claim_unassigned(
            Assignment {
                user_id: pet.user_id,
                pet_id: Some(pet.id),
                order_id: Some(new_order_id),
            },
            old.as_ref().map(|q| q.id),
        )
        .await?
        .ok_or(Error::NoCodesAvailable)?;

    let revoked = match old {
        Some(old) => store.reset_qr(old.id).await?,
        None => None,
    };
    store.set_pet_order(pet.id, new_order_id).await?;

    info!(
        pet_id = %pet.id,
        order_id = %new_order_id,
        revoked = ?revoked.as_ref().map(|q| q.code.as_str()),
        issued = %issued.code,
        "replaced QR code"
    );
    Ok(Replacement { revoked, issued })
}

/// Resets every tag held by the user. Part of account deletion.
pub async fn release_user_codes(store: &dyn Store, user_id: Uuid) -> Result<u64> {
    let released = store.reset_qr_for_user(user_id).await?;
    info!(%user_id, released, "released QR codes");
    Ok(released)
}

/// Creates `count` new unassigned tags.
pub async fn generate_batch(store: &dyn Store, count: usize) -> Result<Vec<QrCode>> {
    if count == 0 || count > MAX_BATCH_SIZE {
        return Err(Error::Validation(format!(
            "count must be between 1 and {MAX_BATCH_SIZE}"
        )));
    }

    let codes = random_codes(count);
    let created = store.insert_qr_codes(&codes).await?;
    info!(count = created.len(), "created QR code batch");
    Ok(created)
}

/// `count` distinct codes, sorted. Kept synchronous: the thread-local rng
/// must not be held across an await.
fn random_codes(count: usize) -> Vec<String> {
    let mut rng = rand::rng();
    let mut codes = HashSet::with_capacity(count);
    while codes.len() < count {
        let suffix: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(CODE_LEN)
            .map(|b| char::from(b).to_ascii_uppercase())
            .collect();
        codes.insert(format!("{CODE_PREFIX}{suffix}"));
    }
    let mut codes: Vec<String> = codes.into_iter().collect();
    codes.sort();
    codes
}

/// Hands out unused tags for printing, marking them downloaded.
pub async fn export_unused(store: &dyn Store, limit: i64) -> Result<Vec<QrCode>> {
    if !(1..=MAX_EXPORT_SIZE).contains(&limit) {
        return Err(Error::Validation(format!(
            "limit must be between 1 and {MAX_EXPORT_SIZE}"
        )));
    }
    let taken = store.take_undownloaded(limit, Utc::now()).await?;
    info!(count = taken.len(), "exported unused QR codes");
    Ok(taken)
}

/// Texts the owner of a scanned tag on behalf of the finder.
pub async fn contact_owner(
    state: &AppState,
    code: &str,
    message: &str,
    finder_phone: Option<&str>,
) -> Result<MessageReceipt> {
    let message = message.trim();
    if message.is_empty() || message.chars().count() > MAX_CONTACT_MESSAGE_LEN {
        return Err(Error::Validation(format!(
            "message must be 1 to {MAX_CONTACT_MESSAGE_LEN} characters"
        )));
    }

    let store = state.store.as_ref();
    let qr = store
        .get_qr_by_code(code)
        .await?
        .ok_or(Error::NotFound("QR code"))?;
    let owner_id = qr
        .assigned_user_id
        .filter(|_| matches!(qr.status, QrStatus::Assigned | QrStatus::Verified))
        .ok_or_else(|| Error::Validation("QR code is not linked to an owner".into()))?;
    let owner = store
        .get_user(owner_id)
        .await?
        .ok_or(Error::NotFound("owner"))?;
    let phone = owner
        .phone
        .as_deref()
        .ok_or_else(|| Error::Validation("owner has no phone number on file".into()))?;

    let mut body = format!("Your pet's tag {} was scanned. Message: {message}", qr.code);
    if let Some(finder) = finder_phone.map(str::trim).filter(|p| !p.is_empty()) {
        body.push_str(&format!(" Finder's number: {finder}"));
    }

    let receipt = state.messenger.send(phone, &body).await?;
    info!(qr_code = %qr.code, user_id = %owner.id, message_id = %receipt.id, "contacted owner");
    Ok(receipt)
}
