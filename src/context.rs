//! Concierge context: location, guest preferences and nearby restaurants.
//!
//! The context is rendered into the system prompt sent with every exchange
//! request and feeds the mock backend's replies.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// Restaurants listed in the prompt, at most.
pub const MAX_PROMPT_RESTAURANTS: usize = 10;

/// One restaurant the concierge may recommend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestaurantSummary {
    pub name: String,
    /// Cuisine tags; the first is the primary cuisine.
    pub cuisines: Vec<String>,
    /// `$` to `$$$$`.
    pub price_level: String,
    /// 1.0 to 5.0.
    pub rating: f32,
}

impl Default for RestaurantSummary {
    fn default() -> Self {
        Self {
            name: String::new(),
            cuisines: Vec::new(),
            price_level: "$$".to_owned(),
            rating: 0.0,
        }
    }
}

impl RestaurantSummary {
    pub fn primary_cuisine(&self) -> &str {
        self.cuisines.first().map_or("Various", String::as_str)
    }

    pub fn serves(&self, cuisine: &str) -> bool {
        self.cuisines.iter().any(|c| c.eq_ignore_ascii_case(cuisine))
    }
}

/// Everything the concierge knows about the guest's surroundings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConciergeContext {
    pub location: String,
    pub preferences: Vec<String>,
    pub restaurants: Vec<RestaurantSummary>,
}

impl ConciergeContext {
    /// Replace location and restaurant list, keeping preferences.
    pub fn set_restaurants(&mut self, location: String, restaurants: Vec<RestaurantSummary>) {
        tracing::info!(
            count = restaurants.len(),
            location = %location,
            "restaurant context updated"
        );
        self.location = location;
        self.restaurants = restaurants;
    }

    pub fn set_preferences(&mut self, preferences: Vec<String>) {
        self.preferences = preferences
            .into_iter()
            .map(|p| p.trim().to_owned())
            .filter(|p| !p.is_empty())
            .collect();
    }

    /// Render the system prompt for the conversational backend.
    pub fn build_system_prompt(&self) -> String {
        let mut prompt = String::from(
            "You are a friendly and knowledgeable restaurant concierge assistant. \
             Your role is to help guests discover great dining experiences by \
             providing personalized restaurant recommendations.\n\n\
             Guidelines:\n\
             - Be conversational, warm, and enthusiastic about food and dining\n\
             - Give specific details about restaurants including cuisine type, price range, ratings, and hours\n\
             - Ask clarifying questions to understand the guest's preferences\n\
             - Keep responses under 30 seconds when spoken\n\
             - If you don't have specific information, say so and offer to help in other ways\n\n",
        );

        if !self.location.is_empty() {
            prompt.push_str(&format!("Current location: {}\n", self.location));
        }
        if !self.preferences.is_empty() {
            prompt.push_str(&format!(
                "Guest preferences: {}\n",
                self.preferences.join(", ")
            ));
        }
        if !self.restaurants.is_empty() {
            prompt.push_str("\nAvailable restaurants:\n");
            for (i, r) in self
                .restaurants
                .iter()
                .take(MAX_PROMPT_RESTAURANTS)
                .enumerate()
            {
                prompt.push_str(&format!(
                    "{}. {} - {} cuisine, {} price range, {:.1} stars\n",
                    i + 1,
                    r.name,
                    r.primary_cuisine(),
                    r.price_level,
                    r.rating
                ));
            }
        }
        prompt
    }
}

/// Context shared between the coordinator and the mock backend.
#[derive(Debug, Clone, Default)]
pub struct ContextHandle {
    inner: Arc<RwLock<ConciergeContext>>,
}

impl ContextHandle {
    pub fn new(context: ConciergeContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(context)),
        }
    }

    /// Copy of the current context.
    pub fn snapshot(&self) -> ConciergeContext {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn system_prompt(&self) -> String {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .build_system_prompt()
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut ConciergeContext) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
