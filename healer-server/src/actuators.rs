use healer_core::actuator::{
    Actuator, ActuatorAction, ActuatorError, ActuatorReply, HttpActuator, SimulatedActuator,
};
use healer_core::HealerConfig;
use serde_json::Value;
use std::future::Future;

/// Actuator chosen at startup: the real HTTP endpoints or the in-process
/// simulation.
pub enum Actuators {
    Http(HttpActuator),
    Simulated(SimulatedActuator),
}

impl Actuators {
    pub fn from_config(config: &HealerConfig) -> Result<Self, ActuatorError> {
        if config.simulate_actuators {
            return Ok(Actuators::Simulated(SimulatedActuator::new()));
        }
        HttpActuator::new(
            config.actuator_base_url.clone(),
            config.executor.actuator_timeout,
        )
        .map(Actuators::Http)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Actuators::Http(_) => "http",
            Actuators::Simulated(_) => "simulated",
        }
    }
}

impl Actuator for Actuators {
    fn call(
        &self,
        action: ActuatorAction,
        payload: Value,
    ) -> impl Future<Output = Result<ActuatorReply, ActuatorError>> + Send {
        async move {
            match self {
                Actuators::Http(http) => http.call(action, payload).await,
                Actuators::Simulated(sim) => sim.call(action, payload).await,
            }
        }
    }
}
