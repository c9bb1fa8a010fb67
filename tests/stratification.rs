use approx::assert_relative_eq;
use epistrat::adjustment;
use epistrat::Flow;
use epistrat::prelude::*;

fn sir(times: Vec<f64>) -> ModelConfig {
    let mut config = ModelConfig::new(times, &["susceptible", "infectious", "recovered"]);
    config.initial_conditions.insert("infectious".to_string(), 0.01);
    config.parameters.insert("beta".to_string(), 3.0);
    config.parameters.insert("recovery".to_string(), 1.0);
    config.parameters.insert(UNIVERSAL_DEATH_RATE.to_string(), 0.02);
    config.birth_approach = BirthApproach::ReplaceDeaths;
    config.flows = vec![
        FlowRequest::infection_frequency("beta", "susceptible", "infectious"),
        FlowRequest::standard("recovery", "infectious", "recovered"),
    ];
    config
}

fn tag(stratification: &str, stratum: &str) -> StratumTag {
    StratumTag::new(stratification, stratum)
}

/// Share of births received by every compartment of the entry stem
fn entry_shares(model: &StratifiedModel) -> Vec<f64> {
    model
        .compartments()
        .names()
        .iter()
        .filter(|name| name.stem() == model.entry_compartment())
        .map(|name| {
            name.layers()
                .iter()
                .map(|layer| {
                    let key = ParameterName::with_layers(ENTRY_FRACTION, std::slice::from_ref(layer));
                    model.parameters().constant_value(&key).unwrap_or(1.0)
                })
                .product::<f64>()
        })
        .collect()
}

#[test]
fn repeated_stratification_preserves_mass() {
    let mut model = StratifiedModel::new(sir(linspace(0.0, 1.0, 2))).unwrap();
    let requests = [
        StratificationRequest::new("risk", ["low", "medium", "high"]).proportion("high", 0.1),
        StratificationRequest::new("location", ["urban", "rural"]).compartments(&["susceptible", "infectious"]),
        StratificationRequest::new(AGE, ["10", "50"]),
    ];
    for request in requests {
        model.stratify(request).unwrap();
        assert_relative_eq!(model.compartments().total(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(
            model.compartments().stem_total("infectious"),
            0.01,
            epsilon = 1e-12
        );
    }
    // 3 x 2 x 3 susceptible and infectious, 3 x 3 recovered
    assert_eq!(model.compartments().len(), 18 + 18 + 9);
    assert_eq!(model.depth(), 3);
}

#[test]
fn entry_shares_sum_to_one() {
    let mut model = StratifiedModel::new(sir(linspace(0.0, 1.0, 2))).unwrap();
    model
        .stratify(
            StratificationRequest::new("location", ["urban", "rural", "remote"])
                .adjust(ENTRY_FRACTION, adjustment!("urban" => 6.0, "rural" => 3.0, "remote" => 1.0)),
        )
        .unwrap();
    model
        .stratify(
            StratificationRequest::new("risk", ["low", "high"])
                .proportion("low", 0.8)
                .proportion("high", 0.2),
        )
        .unwrap();

    let shares = entry_shares(&model);
    assert_eq!(shares.len(), 6);
    assert_relative_eq!(shares.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    // urban low risk: 0.6 x 0.8
    assert_relative_eq!(shares[0], 0.48, epsilon = 1e-12);

    model
        .stratify(StratificationRequest::new(AGE, ["20", "5"]))
        .unwrap();
    let shares = entry_shares(&model);
    assert_relative_eq!(shares.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    let youngest: f64 = model
        .compartments()
        .names()
        .iter()
        .filter(|name| name.stem() == model.entry_compartment())
        .zip(&shares)
        .filter(|(name, _)| name.stratum_for(AGE) == Some("0"))
        .map(|(_, share)| share)
        .sum();
    assert_relative_eq!(youngest, 1.0, epsilon = 1e-12);
}

#[test]
fn ageing_rates_follow_breakpoint_widths() {
    let mut model = StratifiedModel::new(sir(linspace(0.0, 1.0, 2))).unwrap();
    model
        .stratify(StratificationRequest::new(AGE, ["5", "15"]))
        .unwrap();

    let parameters = model.parameters();
    let first = parameters.resolve(&"ageing0to5".into()).unwrap();
    let second = parameters.resolve(&"ageing5to15".into()).unwrap();
    assert_relative_eq!(first.value(0.0), 1.0 / 5.0);
    assert_relative_eq!(second.value(0.0), 1.0 / 10.0);

    let ageing: Vec<&Flow> = model
        .flows()
        .active_flows(FlowCategory::Transition, model.depth())
        .filter(|flow| flow.parameter().base().starts_with("ageing"))
        .collect();
    assert_eq!(ageing.len(), 6);
    assert!(ageing
        .iter()
        .all(|flow| flow.origin().stem() == flow.destination().unwrap().stem()));
    // the oldest stratum never ages out
    assert!(ageing
        .iter()
        .all(|flow| flow.origin().stratum_for(AGE) != Some("15")));
}

#[test]
fn overwrite_truncates_time_variant_base() {
    let mut model = StratifiedModel::builder(sir(linspace(0.0, 1.0, 2)))
        .time_variant("beta", |t| 2.0 + t)
        .build()
        .unwrap();
    model
        .stratify(
            StratificationRequest::new("risk", ["low", "high"])
                .adjust("beta", Adjustment::new().value("low", 0.5).overwrite("high", 4.0)),
        )
        .unwrap();

    let low = ParameterName::new("beta").stratified(tag("risk", "low"));
    let high = ParameterName::new("beta").stratified(tag("risk", "high"));
    let low = model.parameters().resolve(&low).unwrap();
    let high = model.parameters().resolve(&high).unwrap();
    assert!(low.is_time_variant());
    assert!(!high.is_time_variant());
    assert_relative_eq!(low.value(1.0), 0.5 * 3.0);
    assert_relative_eq!(high.value(1.0), 4.0);

    // a deeper multiplier still applies beneath the overwrite
    model
        .stratify(
            StratificationRequest::new("location", ["urban", "rural"])
                .adjust("beta", adjustment!("urban" => 2.0, "rural" => 1.0)),
        )
        .unwrap();
    let nested = ParameterName::new("beta")
        .stratified(tag("risk", "high"))
        .stratified(tag("location", "urban"));
    assert_relative_eq!(model.parameters().resolve(&nested).unwrap().value(5.0), 8.0);
}

#[test]
fn heterogeneous_infectiousness_changes_incidence() {
    let config = ModelConfig::from_json(
        r#"{
            "times": [0.0, 0.5, 1.0],
            "compartment_types": ["susceptible", "infectious", "recovered"],
            "initial_conditions": {"infectious": 0.1},
            "parameters": {"beta": 2.0, "recovery": 0.5},
            "flows": [
                {"type": "infection_frequency", "parameter": "beta", "from": "susceptible", "to": "infectious"},
                {"type": "standard_flows", "parameter": "recovery", "from": "infectious", "to": "recovered"}
            ],
            "output_connections": [
                {"name": "incidence", "origin": "susceptible", "destination": "infectious"}
            ]
        }"#,
    )
    .unwrap();
    let mut model = StratifiedModel::new(config).unwrap();
    let request = StratificationRequest::from_json(
        r#"{
            "name": "strain",
            "strata": ["mild", "severe"],
            "compartments": ["infectious"],
            "infectiousness": {"severe": 3.0}
        }"#,
    )
    .unwrap();
    model.stratify(request).unwrap();
    let results = model.run().unwrap();

    // frequency-dependent force: beta x (0.05 x 1 + 0.05 x 3) / 1, split across both strata
    let incidence = results.derived_output("incidence").unwrap();
    assert_relative_eq!(incidence.values()[0], 2.0 * 0.2 * 0.9, epsilon = 1e-12);
    assert_relative_eq!(results.total_population()[2], 1.0, epsilon = 1e-6);
}

#[test]
fn invalid_requests_are_rejected() {
    let mut model = StratifiedModel::new(sir(linspace(0.0, 1.0, 2))).unwrap();
    assert!(matches!(
        model.stratify(StratificationRequest::new("risk", ["low", "high"]).proportion("low", -1.0)),
        Err(EpiError::InvalidProportions { .. })
    ));
    assert!(matches!(
        model.stratify(
            StratificationRequest::new("risk", ["low", "high"])
                .compartments(&["recovered"])
                .infectiousness("high", 2.0)
        ),
        Err(EpiError::InfectiousnessNotStratified { .. })
    ));
    assert!(matches!(
        model.stratify(StratificationRequest::new("riskXgroup", 2)),
        Err(EpiError::InvalidName { .. })
    ));
    assert!(model.stratifications().is_empty());
    assert_eq!(model.compartments().len(), 3);
}

#[test]
fn stratification_history_is_recorded() {
    let mut model = StratifiedModel::new(sir(linspace(0.0, 1.0, 2))).unwrap();
    model
        .stratify(StratificationRequest::new("risk", 2).compartments(&["infectious"]))
        .unwrap();
    model
        .stratify(StratificationRequest::new(AGE, ["40"]))
        .unwrap();

    let history = model.stratifications();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].name, "risk");
    assert_eq!(history[0].strata, vec!["1", "2"]);
    assert_eq!(history[0].compartments, vec!["infectious"]);
    assert_eq!(history[0].generation, 1);
    assert_eq!(history[1].strata, vec!["0", "40"]);
    assert_eq!(history[1].generation, 2);
    assert_relative_eq!(history[1].proportions[0], 0.5);
}
