//! Trade terms: amount, price and payment method value objects
use super::error::TermsError;

/// Amounts are in the smallest unit of their side (sats for BTC, cents for fiat).
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum AmountSpec {
    #[n(0)]
    BaseSideFixed(#[n(0)] u64),
    #[n(1)]
    QuoteSideFixed(#[n(0)] u64),
    #[n(2)]
    BaseSideRange {
        #[n(0)]
        min: u64,
        #[n(1)]
        max: u64,
    },
    #[n(3)]
    QuoteSideRange {
        #[n(0)]
        min: u64,
        #[n(1)]
        max: u64,
    },
}

impl AmountSpec {
    pub fn verify(&self) -> Result<(), TermsError> {
        match *self {
            AmountSpec::BaseSideFixed(amount) | AmountSpec::QuoteSideFixed(amount) => {
                if amount == 0 {
                    return Err(TermsError::ZeroAmount);
                }
                Ok(())
            }
            AmountSpec::BaseSideRange { min, max } | AmountSpec::QuoteSideRange { min, max } => {
                if min == 0 || min > max {
                    return Err(TermsError::InvalidRange { min, max });
                }
                Ok(())
            }
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum PriceSpec {
    #[n(0)]
    Market,
    // quote minor units per one base unit
    #[n(1)]
    Fixed(#[n(0)] u64),
    // offset from market in basis points
    #[n(2)]
    Float(#[n(0)] i32),
}

impl PriceSpec {
    pub fn verify(&self) -> Result<(), TermsError> {
        match *self {
            PriceSpec::Market => Ok(()),
            PriceSpec::Fixed(0) => Err(TermsError::ZeroPrice),
            PriceSpec::Fixed(_) => Ok(()),
            PriceSpec::Float(bps) if !(-10_000..=10_000).contains(&bps) => {
                Err(TermsError::FloatOutOfRange(bps))
            }
            PriceSpec::Float(_) => Ok(()),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PaymentRail {
    #[n(0)]
    Sepa,
    #[n(1)]
    SepaInstant,
    #[n(2)]
    Wise,
    #[n(3)]
    Zelle,
    #[n(4)]
    Revolut,
    #[n(5)]
    NationalBank,
    #[n(6)]
    Custom(#[n(0)] String),
}

/// Opaque to the engine: compared and serialized, never interpreted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethod {
    #[n(0)]
    pub rail: PaymentRail,
    #[n(1)]
    pub currency_code: String,
    #[n(2)]
    pub country_code: Option<String>,
}

impl PaymentMethod {
    pub fn new(rail: PaymentRail, currency_code: &str) -> Self {
        Self {
            rail,
            currency_code: currency_code.to_owned(),
            country_code: None,
        }
    }
    pub fn in_country(mut self, country_code: &str) -> Self {
        self.country_code = Some(country_code.to_owned());
        self
    }
}

// Also used for constructing drafts
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, PartialEq, Eq)]
pub struct TradeTerms {
    #[n(0)]
    base_currency: Option<String>,
    #[n(1)]
    quote_currency: Option<String>,
    #[n(2)]
    amount: Option<AmountSpec>,
    #[n(3)]
    price: Option<PriceSpec>,
    #[n(4)]
    payment_method: Option<PaymentMethod>,
}

impl TradeTerms {
    /// Construct a new builder object, this becomes the basis for a draft
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_base_currency(mut self, code: &str) -> Self {
        self.base_currency = Some(code.to_owned());
        self
    }
    pub fn set_quote_currency(mut self, code: &str) -> Self {
        self.quote_currency = Some(code.to_owned());
        self
    }
    pub fn set_amount(mut self, amount: AmountSpec) -> Self {
        self.amount = Some(amount);
        self
    }
    pub fn set_price(mut self, price: PriceSpec) -> Self {
        self.price = Some(price);
        self
    }
    pub fn set_payment_method(mut self, method: PaymentMethod) -> Self {
        self.payment_method = Some(method);
        self
    }
    pub fn amount(&self) -> Option<&AmountSpec> {
        self.amount.as_ref()
    }
    pub fn price(&self) -> Option<&PriceSpec> {
        self.price.as_ref()
    }
    pub fn payment_method(&self) -> Option<&PaymentMethod> {
        self.payment_method.as_ref()
    }
    pub fn base_currency(&self) -> Option<&str> {
        self.base_currency.as_deref()
    }
    pub fn quote_currency(&self) -> Option<&str> {
        self.quote_currency.as_deref()
    }

    /// Checks every part of the terms. Once this passes the terms are immutable
    /// inputs to guards and it will not fail again.
    pub fn verify(&self) -> Result<(), TermsError> {
        verify_currency("base", self.base_currency.as_deref())?;
        verify_currency("quote", self.quote_currency.as_deref())?;
        self.amount.as_ref().ok_or(TermsError::MissingAmount)?.verify()?;
        self.price.as_ref().ok_or(TermsError::MissingPrice)?.verify()?;
        if self.payment_method.is_none() {
            return Err(TermsError::MissingPaymentMethod);
        }
        Ok(())
    }

    /// sha256 over the CBOR encoding. The taker commits to this value when
    /// taking the offer.
    pub fn fingerprint(&self) -> Result<String, TermsError> {
        let contents = minicbor::to_vec(self).map_err(|e| TermsError::Encoding(e.to_string()))?;
        Ok(sha256::digest(&contents))
    }
}

fn verify_currency(side: &'static str, code: Option<&str>) -> Result<(), TermsError> {
    let code = code.ok_or(TermsError::MissingCurrency(side))?;
    let well_formed = (2..=8).contains(&code.len())
        && code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if !well_formed {
        return Err(TermsError::MalformedCurrency(code.to_owned()));
    }
    Ok(())
}
