//! Toll-pass back office: staff accounts, vehicle-category rates, passes,
//! receipts and revenue figures.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::data::{AuthService, Backend, TollService, TransactionFilter};
use crate::model::{
    CategoryDraft, Identity, NewTollPass, NewTransaction, PassStatus, SignUp, StaffMember,
    StaffUpdate, TollPass, Transaction, VehicleCategory,
};

pub const QUICK_PASS_DAYS: i64 = 30;
pub const MIN_VEHICLE_NUMBER: usize = 3;
pub const MIN_SEARCH_FRAGMENT: usize = 3;
pub const MIN_PASSWORD: usize = 6;

/// Form errors keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, thiserror::Error)]
#[error("{}", summarize(.fields))]
pub struct ValidationErrors {
    fields: BTreeMap<&'static str, String>,
}

impl ValidationErrors {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.entry(field).or_insert_with(|| message.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn summarize(fields: &BTreeMap<&'static str, String>) -> String {
    fields
        .iter()
        .map(|(field, message)| format!("{}: {}", field, message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassDraft {
    pub vehicle_number: String,
    pub category_id: Option<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: PassStatus,
}

impl PassDraft {
    /// Active pass for `vehicle_number` starting at `now`.
    pub fn quick(vehicle_number: &str, category_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            vehicle_number: vehicle_number.to_string(),
            category_id: Some(category_id.to_string()),
            valid_from: now,
            valid_until: now + Duration::days(QUICK_PASS_DAYS),
            status: PassStatus::Active,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.vehicle_number.trim().chars().count() < MIN_VEHICLE_NUMBER {
            errors.add(
                "vehicle_number",
                format!("must be at least {} characters", MIN_VEHICLE_NUMBER),
            );
        }
        if self
            .category_id
            .as_deref()
            .map_or(true, |id| id.trim().is_empty())
        {
            errors.add("category_id", "select a vehicle category");
        }
        if self.valid_until <= self.valid_from {
            errors.add("valid_until", "must be after the start date");
        }
        errors.into_result()
    }

    fn to_row(&self, created_by: &str) -> NewTollPass {
        NewTollPass {
            vehicle_number: self.vehicle_number.trim().to_string(),
            category_id: self.category_id.clone().unwrap_or_default(),
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            status: self.status,
            created_by: Some(created_by.to_string()),
        }
    }
}

pub fn validate_category(draft: &CategoryDraft) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    if draft.name.trim().is_empty() {
        errors.add("name", "is required");
    }
    if !draft.base_rate.is_finite() || draft.base_rate < 0.0 {
        errors.add("base_rate", "must be zero or more");
    }
    if !draft.creation_fee.is_finite() || draft.creation_fee < 0.0 {
        errors.add("creation_fee", "must be zero or more");
    }
    errors.into_result()
}

pub fn validate_staff(email: &str, password: &str, full_name: &str) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        errors.add("email", "enter a valid email address");
    }
    if password.chars().count() < MIN_PASSWORD {
        errors.add(
            "password",
            format!("must be at least {} characters", MIN_PASSWORD),
        );
    }
    if full_name.trim().is_empty() {
        errors.add("full_name", "is required");
    }
    errors.into_result()
}

/// Amount due at the booth: the base rate, plus the creation fee when the
/// vehicle has no pass yet.
pub fn receipt_total(category: &VehicleCategory, existing_pass: bool) -> f64 {
    if existing_pass {
        category.base_rate
    } else {
        category.base_rate + category.creation_fee
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub transaction: Transaction,
    pub pass: TollPass,
    pub category: String,
    pub pass_created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryStats {
    pub name: String,
    pub revenue: f64,
    pub transactions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaffStats {
    pub staff_id: String,
    pub name: String,
    pub revenue: f64,
    pub transactions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analytics {
    pub total_revenue: f64,
    pub transactions: usize,
    pub categories: Vec<CategoryStats>,
    pub staff: Vec<StaffStats>,
    pub active_passes: usize,
}

pub struct TollDesk {
    auth: Arc<dyn AuthService>,
    toll: Arc<dyn TollService>,
}

impl TollDesk {
    pub fn new(backend: &Backend) -> Self {
        Self {
            auth: backend.auth.clone(),
            toll: backend.toll.clone(),
        }
    }

    pub fn list_staff(&self) -> Result<Vec<StaffMember>> {
        self.toll.list_staff().context("toll: list staff")
    }

    pub fn register_staff(&self, email: &str, password: &str, full_name: &str) -> Result<Identity> {
        validate_staff(email, password, full_name)?;
        let identity = self.auth.sign_up(&SignUp {
            email: email.trim().to_string(),
            password: password.to_string(),
            full_name: full_name.trim().to_string(),
        })?;
        info!(staff_id = %identity.id, "staff member registered");
        Ok(identity)
    }

    pub fn update_staff(&self, id: &str, update: &StaffUpdate) -> Result<StaffMember> {
        if let Some(name) = &update.full_name {
            if name.trim().is_empty() {
                let mut errors = ValidationErrors::default();
                errors.add("full_name", "is required");
                return Err(errors.into());
            }
        }
        self.toll
            .update_staff(id, update)
            .with_context(|| format!("toll: update staff {}", id))
    }

    pub fn delete_staff(&self, id: &str) -> Result<()> {
        self.toll
            .delete_staff(id)
            .with_context(|| format!("toll: delete staff {}", id))
    }

    pub fn list_categories(&self) -> Result<Vec<VehicleCategory>> {
        self.toll.list_categories().context("toll: list categories")
    }

    pub fn create_category(&self, draft: &CategoryDraft) -> Result<VehicleCategory> {
        validate_category(draft)?;
        let category = self.toll.create_category(draft)?;
        info!(category = %category.name, "vehicle category created");
        Ok(category)
    }

    pub fn update_category(&self, id: &str, draft: &CategoryDraft) -> Result<VehicleCategory> {
        validate_category(draft)?;
        self.toll
            .update_category(id, draft)
            .with_context(|| format!("toll: update category {}", id))
    }

    pub fn list_passes(&self) -> Result<Vec<TollPass>> {
        self.toll.list_passes().context("toll: list passes")
    }

    pub fn issue_pass(&self, draft: &PassDraft, staff_id: &str) -> Result<TollPass> {
        draft.validate()?;
        let pass = self.toll.create_pass(&draft.to_row(staff_id))?;
        info!(pass_id = %pass.id, vehicle = %pass.vehicle_number, "pass issued");
        Ok(pass)
    }

    pub fn update_pass(&self, id: &str, draft: &PassDraft, staff_id: &str) -> Result<TollPass> {
        draft.validate()?;
        self.toll
            .update_pass(id, &draft.to_row(staff_id))
            .with_context(|| format!("toll: update pass {}", id))
    }

    /// Active passes whose vehicle number contains `fragment`; shorter
    /// fragments return nothing.
    pub fn search_active_passes(&self, fragment: &str) -> Result<Vec<TollPass>> {
        let fragment = fragment.trim();
        if fragment.chars().count() < MIN_SEARCH_FRAGMENT {
            return Ok(Vec::new());
        }
        self.toll
            .search_active_passes(fragment)
            .context("toll: search passes")
    }

    pub fn quick_pass(
        &self,
        vehicle_number: &str,
        category_id: &str,
        staff_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TollPass> {
        self.issue_pass(&PassDraft::quick(vehicle_number, category_id, now), staff_id)
    }

    /// Charges a vehicle at the booth. A vehicle without a current pass
    /// gets a quick pass and pays the creation fee on top of the rate.
    pub fn process_toll(
        &self,
        vehicle_number: &str,
        category_id: &str,
        staff_id: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Receipt> {
        let category = self
            .list_categories()?
            .into_iter()
            .find(|category| category.id == category_id)
            .ok_or_else(|| anyhow!("vehicle category {} not found", category_id))?;

        let existing = self
            .search_active_passes(vehicle_number)?
            .into_iter()
            .find(|pass| {
                pass.vehicle_number
                    .eq_ignore_ascii_case(vehicle_number.trim())
                    && pass.valid_until > now
            });
        let pass_created = existing.is_none();
        let amount = receipt_total(&category, !pass_created);
        let pass = match existing {
            Some(pass) => pass,
            None => self.quick_pass(vehicle_number, category_id, staff_id, now)?,
        };

        let transaction = self.record_transaction(Some(&pass.id), amount, staff_id, notes)?;
        Ok(Receipt {
            transaction,
            pass,
            category: category.name,
            pass_created,
        })
    }

    pub fn record_transaction(
        &self,
        pass_id: Option<&str>,
        amount: f64,
        staff_id: &str,
        notes: Option<&str>,
    ) -> Result<Transaction> {
        if !amount.is_finite() || amount < 0.0 {
            let mut errors = ValidationErrors::default();
            errors.add("amount", "must be zero or more");
            return Err(errors.into());
        }
        let receipt_number = self
            .toll
            .generate_receipt_number()
            .context("toll: generate receipt number")?;
        let transaction = self.toll.create_transaction(&NewTransaction {
            pass_id: pass_id.map(str::to_string),
            amount,
            processed_by: staff_id.to_string(),
            notes: notes
                .map(str::trim)
                .filter(|notes| !notes.is_empty())
                .map(str::to_string),
            receipt_number,
        })?;
        info!(
            receipt = %transaction.receipt_number,
            amount = transaction.amount,
            "transaction recorded"
        );
        Ok(transaction)
    }

    pub fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        self.toll
            .list_transactions(filter)
            .context("toll: list transactions")
    }

    pub fn analytics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Analytics> {
        let transactions = self.list_transactions(&TransactionFilter {
            from,
            to,
            ..TransactionFilter::default()
        })?;
        let staff = self.list_staff()?;
        let active_passes = self
            .toll
            .count_active_passes()
            .context("toll: count active passes")?;
        Ok(summarize_transactions(&transactions, &staff, active_passes))
    }
}

pub fn summarize_transactions(
    transactions: &[Transaction],
    staff: &[StaffMember],
    active_passes: usize,
) -> Analytics {
    let mut categories: BTreeMap<String, CategoryStats> = BTreeMap::new();
    let mut by_staff: BTreeMap<String, StaffStats> = BTreeMap::new();
    let mut total_revenue = 0.0;

    for transaction in transactions {
        total_revenue += transaction.amount;

        let name = transaction
            .toll_passes
            .as_ref()
            .and_then(|pass| pass.vehicle_categories.as_ref())
            .map(|category| category.name.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        let entry = categories
            .entry(name.clone())
            .or_insert_with(|| CategoryStats {
                name,
                revenue: 0.0,
                transactions: 0,
            });
        entry.revenue += transaction.amount;
        entry.transactions += 1;

        let staff_id = transaction.processed_by.clone();
        let entry = by_staff.entry(staff_id.clone()).or_insert_with(|| {
            let name = staff
                .iter()
                .find(|member| member.id == staff_id)
                .map(|member| member.full_name.clone())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| staff_id.clone());
            StaffStats {
                staff_id,
                name,
                revenue: 0.0,
                transactions: 0,
            }
        });
        entry.revenue += transaction.amount;
        entry.transactions += 1;
    }

    Analytics {
        total_revenue,
        transactions: transactions.len(),
        categories: categories.into_values().collect(),
        staff: by_staff.into_values().collect(),
        active_passes,
    }
}
